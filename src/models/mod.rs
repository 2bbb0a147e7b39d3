pub mod call_session;
pub mod vehicle;

pub use call_session::{CallSession, CallStatus, NewCallSession};
pub use vehicle::Vehicle;

/// Canonical plate form: uppercase with every whitespace character removed.
///
/// The result doubles as the media channel name, so caller and owner agree on
/// a room without extra coordination.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}
