// qa-core: shared machinery for the QA broker and client.
//
// Identity and signed address bookkeeping, the client settings blob, the
// per-connection endpoint workers, and the shutdown latch they obey.

pub mod address_book;
pub mod identity;
pub mod settings;
pub mod shutdown;
pub mod util;
pub mod workers;

pub use address_book::{AddressBook, AddressBookError, AddressRecord, PeerList};
pub use settings::{Settings, SettingsError};
pub use shutdown::{LatchState, RESTART_PARTIES, ShutdownLatch, ShutdownRx};
pub use workers::{Endpoint, EndpointEvent};
