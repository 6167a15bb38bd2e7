pub mod clock;
pub mod http_client;
pub mod sqlite_store;

pub use clock::{ManualClock, SystemClock};
pub use http_client::ReqwestHttp;
pub use sqlite_store::SqliteDocumentStore;
