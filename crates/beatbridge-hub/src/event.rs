//! Notifications for the host process

/// Hub notification relayed to the host (tray, status window, logs).
///
/// Delivered over a `tokio::sync::broadcast` channel; see [`crate::Hub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HubEvent {
    Started,
    Stopped,
    /// Session tempo changed
    Tempo(f64),
    /// Transport started or stopped
    Playing(bool),
    /// Clock-sync peer count changed
    Peers(u32),
    /// WebSocket client count changed
    Clients(usize),
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::Started => "started",
            HubEvent::Stopped => "stopped",
            HubEvent::Tempo(_) => "tempo",
            HubEvent::Playing(_) => "playing",
            HubEvent::Peers(_) => "peers",
            HubEvent::Clients(_) => "clients",
        }
    }
}
