//! Connection lifecycle.
//!
//! A pure state machine: each event returns the side effects the link
//! driver has to carry out. Reconnection uses a fixed interval and a
//! bounded number of attempts. Once the cap is hit the supervisor parks in
//! `Disconnected` until an external reset.

use std::time::Duration;
use tracing::{info, warn};

/// State of the server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Connected
    Connected,
    /// Disconnected, waiting for the reconnect timer
    Reconnecting,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay between attempts
    pub interval: Duration,
    /// Attempts after a disconnect before giving up
    pub max_attempts: u32,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Side effects requested by the supervisor, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    CancelTimer,
    AnnounceOnline,
    StartHeartbeat,
    StopHeartbeat,
    ClearConnection,
    ArmTimer,
}

#[derive(Debug)]
pub struct Supervisor {
    config: ReconnectConfig,
    state: ConnectionState,
    attempts: u32,
    timer_armed: bool,
}

impl Supervisor {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            attempts: 0,
            timer_armed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnection attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Initial connect. Doesn't count against the cap.
    pub fn start(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Action::Connect]
    }

    pub fn on_connected(&mut self) -> Vec<Action> {
        if self.attempts > 0 {
            info!("Connected after {} reconnect attempt(s)", self.attempts);
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.timer_armed = false;
        vec![Action::CancelTimer, Action::AnnounceOnline, Action::StartHeartbeat]
    }

    /// Connection closed, cleanly or not.
    pub fn on_disconnected(&mut self, status: Option<u16>) -> Vec<Action> {
        let actions = match self.state {
            ConnectionState::Connected => {
                info!("Disconnected (status {:?})", status);
                vec![Action::StopHeartbeat, Action::ClearConnection, Action::ArmTimer]
            }
            // A failed attempt: just try again later
            ConnectionState::Connecting | ConnectionState::Reconnecting => vec![Action::ArmTimer],
            // Parked at the cap; stay there
            ConnectionState::Disconnected => return Vec::new(),
        };
        self.state = ConnectionState::Reconnecting;
        self.timer_armed = true;
        actions
    }

    pub fn on_transport_error(&mut self, status: Option<u16>) -> Vec<Action> {
        self.on_disconnected(status)
    }

    /// Reconnect timer fired.
    pub fn on_timer(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        self.timer_armed = false;
        if self.attempts >= self.config.max_attempts {
            warn!(
                "Giving up after {} reconnect attempts; waiting for reset",
                self.attempts
            );
            self.state = ConnectionState::Disconnected;
            return Vec::new();
        }
        self.attempts += 1;
        self.state = ConnectionState::Connecting;
        info!(
            "Reconnecting (attempt {}/{})",
            self.attempts, self.config.max_attempts
        );
        vec![Action::Connect]
    }

    /// External reset: clear the counter and, if parked, try again now.
    pub fn reset(&mut self) -> Vec<Action> {
        self.attempts = 0;
        if self.state == ConnectionState::Disconnected {
            info!("Reconnect counter reset, connecting");
            self.state = ConnectionState::Connecting;
            return vec![Action::Connect];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(max_attempts: u32) -> Supervisor {
        Supervisor::new(ReconnectConfig {
            max_attempts,
            ..Default::default()
        })
    }

    #[test]
    fn test_start_connects_once() {
        let mut sup = supervisor(3);
        assert_eq!(sup.start(), vec![Action::Connect]);
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.start(), vec![]);
        assert_eq!(sup.attempts(), 0);
    }

    #[test]
    fn test_connect_actions() {
        let mut sup = supervisor(3);
        sup.start();
        assert_eq!(
            sup.on_connected(),
            vec![Action::CancelTimer, Action::AnnounceOnline, Action::StartHeartbeat]
        );
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_actions() {
        let mut sup = supervisor(3);
        sup.start();
        sup.on_connected();
        assert_eq!(
            sup.on_disconnected(Some(1006)),
            vec![Action::StopHeartbeat, Action::ClearConnection, Action::ArmTimer]
        );
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
        assert!(sup.timer_armed());
    }

    #[test]
    fn test_failed_attempts_rearm_timer() {
        let mut sup = supervisor(3);
        sup.start();
        assert_eq!(sup.on_transport_error(None), vec![Action::ArmTimer]);

        assert_eq!(sup.on_timer(), vec![Action::Connect]);
        assert_eq!(sup.attempts(), 1);
        assert_eq!(sup.on_transport_error(None), vec![Action::ArmTimer]);
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_attempts_are_capped() {
        let mut sup = supervisor(3);
        sup.start();
        sup.on_transport_error(None);

        let mut connects = 0;
        for _ in 0..10 {
            if sup.on_timer().contains(&Action::Connect) {
                connects += 1;
                sup.on_transport_error(None);
            }
        }
        assert_eq!(connects, 3);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert!(!sup.timer_armed());
    }

    #[test]
    fn test_timer_at_cap_does_not_connect() {
        let mut sup = supervisor(2);
        sup.start();
        sup.on_transport_error(None);
        sup.on_timer();
        sup.on_transport_error(None);
        sup.on_timer();
        sup.on_transport_error(None);
        assert_eq!(sup.attempts(), 2);

        // Timer fires with the counter already at the cap
        assert_eq!(sup.on_timer(), vec![]);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert!(!sup.timer_armed());

        // Parked: late errors and timers change nothing
        assert_eq!(sup.on_transport_error(None), vec![]);
        assert_eq!(sup.on_timer(), vec![]);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reset_restarts_from_parked() {
        let mut sup = supervisor(1);
        sup.start();
        sup.on_transport_error(None);
        sup.on_timer();
        sup.on_transport_error(None);
        sup.on_timer();
        assert_eq!(sup.state(), ConnectionState::Disconnected);

        assert_eq!(sup.reset(), vec![Action::Connect]);
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.attempts(), 0);
    }

    #[test]
    fn test_reset_while_reconnecting_only_clears_counter() {
        let mut sup = supervisor(5);
        sup.start();
        sup.on_transport_error(None);
        sup.on_timer();
        sup.on_transport_error(None);
        assert_eq!(sup.attempts(), 1);

        assert_eq!(sup.reset(), vec![]);
        assert_eq!(sup.attempts(), 0);
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_successful_reconnect_resets_counter() {
        let mut sup = supervisor(5);
        sup.start();
        sup.on_connected();
        sup.on_disconnected(None);
        sup.on_timer();
        sup.on_transport_error(None);
        sup.on_timer();
        assert_eq!(sup.attempts(), 2);

        sup.on_connected();
        assert_eq!(sup.attempts(), 0);
        assert!(!sup.timer_armed());
    }
}
