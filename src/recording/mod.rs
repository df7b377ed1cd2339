//! Recording: the session gate, per-source caches, saver backends and the saver participant.
//!
//! Data flows `worker -> saver cache -> backend`. Savers cache DATA only while a recording
//! is active; `stop_recording` drains every cache into the backend and closes its files.
//! Recording `idx` of a session with filename `run` writes files with stem `run_<idx:03>`,
//! so consecutive recordings into one directory never overwrite each other.
//!
//! | Backend        | Files                                        | Feature         |
//! |----------------|----------------------------------------------|-----------------|
//! | `tabular`      | `<stem>.csv`                                 | `storage_csv`   |
//! | `frames`       | `<stem>.frames`, `.frames.json`, `.frames.csv` | `storage_csv` |
//! | `hierarchical` | `<stem>.h5`                                  | `storage_hdf5`  |

pub mod backend;
pub mod cache;
#[cfg(feature = "storage_csv")]
pub mod frames;
pub mod hierarchical;
pub mod journal;
pub mod saver;
pub mod session;
#[cfg(feature = "storage_csv")]
pub mod tabular;

pub use backend::{BackendRegistry, FlushSummary, SaverBackend};
pub use cache::{CachedEntry, RecordingCache, Sample, SourceCache};
pub use journal::{Journal, LoggedEvent, LoggedString, QUERY_DATA, QUERY_EVENTS, QUERY_MESSAGES};
pub use saver::{Saver, QUERIES, START_RECORDING, STATUS, STOP_RECORDING};
pub use session::{RecordingSession, RecordingTarget};
