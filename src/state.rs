// shared by client and server connections: Disconnected -> Connecting ->
// HandshakeSent -> Active -> Failing -> Disconnected, on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    Active,
    Failing,
}
