use serde::{Deserialize, Serialize};
use std::fmt;

/// Strategy run states, advanced only by the strategy runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyRunState {
    /// Runner constructed, engine not started
    Initializing,
    /// Logon sent, waiting for the session to come up
    AwaitingLogon,
    /// Security list requested
    AwaitingReferenceData,
    /// Market data subscribed, waiting for a first snapshot per instrument
    AwaitingMarketData,
    /// Position and working-order snapshots requested
    AwaitingSnapshot,
    /// Prerequisite data present, strategy notified
    Ready,
    /// Main trading loop active
    Running,
    /// Teardown in progress
    Stopping,
    /// Teardown complete
    Stopped,
}

impl StrategyRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyRunState::Initializing => "INITIALIZING",
            StrategyRunState::AwaitingLogon => "AWAITING_LOGON",
            StrategyRunState::AwaitingReferenceData => "AWAITING_REFERENCE_DATA",
            StrategyRunState::AwaitingMarketData => "AWAITING_MARKET_DATA",
            StrategyRunState::AwaitingSnapshot => "AWAITING_SNAPSHOT",
            StrategyRunState::Ready => "READY",
            StrategyRunState::Running => "RUNNING",
            StrategyRunState::Stopping => "STOPPING",
            StrategyRunState::Stopped => "STOPPED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: StrategyRunState) -> bool {
        use StrategyRunState::*;

        match (self, target) {
            // Startup sequence, strictly ordered
            (Initializing, AwaitingLogon) => true,
            (AwaitingLogon, AwaitingReferenceData) => true,
            (AwaitingReferenceData, AwaitingMarketData) => true,
            (AwaitingMarketData, AwaitingSnapshot) => true,
            (AwaitingSnapshot, Ready) => true,
            (Ready, Running) => true,

            // Any live state may tear down (completion, failure, shutdown)
            (Stopping, Stopped) => true,
            (Stopped, _) => false,
            (Stopping, _) => false,
            (_, Stopping) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<StrategyRunState> {
        use StrategyRunState::*;

        match self {
            Initializing => vec![AwaitingLogon, Stopping],
            AwaitingLogon => vec![AwaitingReferenceData, Stopping],
            AwaitingReferenceData => vec![AwaitingMarketData, Stopping],
            AwaitingMarketData => vec![AwaitingSnapshot, Stopping],
            AwaitingSnapshot => vec![Ready, Stopping],
            Ready => vec![Running, Stopping],
            Running => vec![Stopping],
            Stopping => vec![Stopped],
            Stopped => vec![],
        }
    }

    /// Is the runner still executing the startup handshake?
    pub fn is_starting(&self) -> bool {
        matches!(
            self,
            StrategyRunState::Initializing
                | StrategyRunState::AwaitingLogon
                | StrategyRunState::AwaitingReferenceData
                | StrategyRunState::AwaitingMarketData
                | StrategyRunState::AwaitingSnapshot
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyRunState::Stopped)
    }
}

impl fmt::Display for StrategyRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StrategyRunState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "INITIALIZING" => Ok(StrategyRunState::Initializing),
            "AWAITING_LOGON" => Ok(StrategyRunState::AwaitingLogon),
            "AWAITING_REFERENCE_DATA" => Ok(StrategyRunState::AwaitingReferenceData),
            "AWAITING_MARKET_DATA" => Ok(StrategyRunState::AwaitingMarketData),
            "AWAITING_SNAPSHOT" => Ok(StrategyRunState::AwaitingSnapshot),
            "READY" => Ok(StrategyRunState::Ready),
            "RUNNING" => Ok(StrategyRunState::Running),
            "STOPPING" => Ok(StrategyRunState::Stopping),
            "STOPPED" => Ok(StrategyRunState::Stopped),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: StrategyRunState,
    pub to: StrategyRunState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: StrategyRunState, to: StrategyRunState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Session-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    LoggingOn,
    LoggedOn,
    LoggingOut,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::LoggingOn => "LOGGING_ON",
            SessionState::LoggedOn => "LOGGED_ON",
            SessionState::LoggingOut => "LOGGING_OUT",
        }
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Disconnected, LoggingOn) => true,
            (LoggingOn, LoggedOn) => true,
            (LoggedOn, LoggingOut) => true,
            // Logon resent while a previous attempt is still outstanding
            (LoggingOn, LoggingOn) => true,
            // Logout, disconnect or logon failure
            (LoggingOn | LoggedOn | LoggingOut, Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::LoggedOn)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
