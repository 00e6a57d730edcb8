//! # Sincetail
//!
//! Sincetail displays whatever was appended to a set of files since the previous run. The offset
//! reached in every file is remembered in a small state file, keyed by the storage identity of
//! the file rather than its name, so rotated or renamed logs keep their position.
//!
//! * `RecordFormat` encodes one state record as fixed width hex text. Field widths are inferred
//! from the state file itself, so one file can be shared between architectures.
//!
//! ```rust
//! # use sincetail::{FieldWidths, Identity, RecordFormat};
//! let format = RecordFormat::new(FieldWidths::new(4, 4, 4))?;
//! let record = format.encode(Identity { device: 3, inode: 0xa1b2 }, 1024)?;
//! assert_eq!(record, b"00000003:0000a1b2:00000400\n");
//! assert_eq!(
//!     format.decode(&record),
//!     Some((Identity { device: 3, inode: 0xa1b2 }, 1024))
//! );
//! # Ok::<(), sincetail::StateError>(())
//! ```
//!
//! * `StateStore` loads, validates, widens and persists the state file. Updates either patch
//! records in place or replace the file through a rename, so readers never see a torn file.
//!
//! * `run` ties everything together: it binds the targets to their records, displays unread
//! content to an `Output`, optionally follows the files for changes and persists the reached
//! offsets.
//!
//! ```rust no_run
//! # use std::path::PathBuf;
//! # use sincetail::{Options, Shutdown, Terminal};
//! let options = Options {
//!     state_file: Some(PathBuf::from("/var/tmp/since")),
//!     ..Options::default()
//! };
//! let shutdown = Shutdown::install()?;
//! let mut output = Terminal::new(options.headers);
//! let report = sincetail::run(
//!     &options,
//!     &[PathBuf::from("/var/log/syslog")],
//!     &mut output,
//!     &shutdown,
//! )?;
//! println!("{:?}", report.persisted);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!

pub mod config;
mod data_file;
pub mod display;
mod error;
pub mod identity;
mod mapping;
pub mod output;
pub mod record;
mod session;
mod signals;
pub mod state_store;
pub mod watch;

pub use config::Options;
pub use data_file::{DataFile, Status};
pub use display::{Display, Flow};
pub use error::{ExitClass, SinceError, StateError};
pub use identity::Identity;
pub use output::{HeaderTarget, Output, Terminal};
pub use record::{FieldWidths, RecordFormat};
pub use session::{run, RunReport};
pub use signals::Shutdown;
pub use state_store::{Candidate, PersistReport, StateStore, StoreSettings};
pub use watch::WatchMode;
