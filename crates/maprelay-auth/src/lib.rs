//! maprelay Auth - Login sessions, credential import and device storage
//!
//! Tracks in-flight sign-ins per browser session and keeps the credentials of
//! registered devices.
//!
//! # Login Flow
//!
//! 1. A handler calls `SessionPool::create_session()` for the browser's key
//! 2. `SessionRecord::start()` fetches the provider's first sign-in page
//! 3. Each browser request is forwarded through the record's proxy session
//! 4. Once an access token appears, the device is registered and the bundle
//!    is saved with `BundleStore::save_bundle()`
//! 5. The record is removed with `SessionPool::remove_by_key()`
//!
//! # Example
//!
//! ```no_run
//! use maprelay_auth::{SessionPool, DEFAULT_SESSION_TTL_SECONDS};
//! use maprelay_proxy::ProxyOptions;
//!
//! async fn example() {
//!     let pool = SessionPool::new(ProxyOptions::default());
//!     let ttl = chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECONDS);
//!     let record = pool.create_session("browser-key", "de", false, ttl).await.unwrap();
//!     println!("Proxy path: /login/{}", record.id());
//! }
//! ```

pub mod import;
pub mod pool;
pub mod storage;

pub use import::{import_credentials, CredentialCipher, EncryptedDict, DEFAULT_KDF_ITERATIONS};
pub use pool::{
    PoolError, PoolResult, SessionPool, SessionRecord, SessionStatus, DEFAULT_SESSION_TTL_SECONDS,
};
pub use storage::{BundleStore, DeviceId, DeviceSummary, StorageError, StorageResult, StoredDevice};
