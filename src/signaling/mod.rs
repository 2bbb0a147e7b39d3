//! Call signaling: turning a scan into a ringing session, and driving both
//! ends of it until the call is over.
pub mod caller;
pub mod error;
pub mod owner;
pub mod reconcile;
pub mod resolver;
pub mod ringer;
pub mod session;
pub mod starter;
pub mod sweeper;

pub use caller::{CallerCommand, CallerEngine, CallerPhase, CallerSnapshot};
pub use error::{EngineError, ResolveError, StartCallError};
pub use owner::{OwnerCommand, OwnerEngine, OwnerEngineBuilder, OwnerPhase, OwnerSnapshot};
pub use reconcile::{Delivery, Reconciler};
pub use resolver::{MatchKind, PlateResolver, Resolution};
pub use ringer::{Ringer, SilentRinger};
pub use session::{CallService, StartCallRequest};
pub use starter::CallStarter;
pub use sweeper::ExpirySweeper;
