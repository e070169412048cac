/// Builder assembling an evaluator and its scheduler.
pub mod builder;
/// The coordinator task owning the canonical snapshot.
pub mod evaluator;
/// In-process peer transport.
pub mod link;
/// TCP adapter for the length-prefixed wire protocol.
pub mod tcp;

pub use builder::EvaluatorBuilder;
pub use evaluator::{Evaluator, EvaluatorHandle, EvaluatorState};
pub use link::{PeerLink, PeerSender};
pub use tcp::{bridge, serve_tcp};
