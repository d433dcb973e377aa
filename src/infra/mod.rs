// Adapters for the outside world: the Socrata source, the BigQuery sink and
// the credentials the sink needs.

pub mod bigquery;
pub mod credentials;
pub mod socrata;

pub use bigquery::BigQueryTable;
pub use credentials::ServiceAccountKey;
pub use socrata::SocrataSource;
