//! wsgate core — identities, message envelopes, clocks, and the credential/session store contracts.

pub mod clock;
pub mod envelope;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use envelope::{CloseReason, Envelope, FrameKind};
pub use traits::{CredentialError, CredentialStore, SessionStore};
pub use types::{Identity, IdentitySource, Principal, ResolvedIdentity};
