//! Channel lifecycle states

use std::fmt;

/// Where the channel is in its connect/disconnect lifecycle
///
/// | From                 | Event                        | To                   |
/// |----------------------|------------------------------|----------------------|
/// | Disconnected         | connect, gate present        | WaitingForPermission |
/// | Disconnected         | connect, attach succeeds     | Connected            |
/// | WaitingForPermission | granted, attach succeeds     | Connected            |
/// | WaitingForPermission | denied or attach fails       | Disconnected         |
/// | WaitingForPermission | disconnect                   | Disconnecting        |
/// | Disconnecting        | pending request resolves     | Disconnected         |
/// | Connected            | disconnect                   | Disconnected         |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Disconnected,
    /// Waiting on the permission gate for a physically present device
    WaitingForPermission,
    Connected,
    /// A disconnect arrived while a permission request was pending
    Disconnecting,
}

impl ChannelState {
    /// A new connect may only start from a quiescent channel
    pub fn can_connect(self) -> bool {
        self == ChannelState::Disconnected
    }

    /// States from which an attach may move the channel to `Connected`
    pub fn can_attach(self) -> bool {
        matches!(
            self,
            ChannelState::Disconnected | ChannelState::WaitingForPermission
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::WaitingForPermission => "waiting-for-permission",
            ChannelState::Connected => "connected",
            ChannelState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}
