//! Server-side connection state machine.
//!
//! The server behaves as a fixed finite-state machine per connection; which
//! messages are legal, and what state follows a SUCCESS/FAILURE/IGNORED
//! response, is defined by the Bolt server-state specification. The table
//! below encodes that specification as exhaustive tuples so it can be audited
//! and tested row by row instead of being buried in conditionals.

/// The protocol-level mode a connection is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Handshake complete, HELLO not yet exchanged.
    Connected,
    /// Authenticated and idle.
    Ready,
    /// Auto-commit query running, records available via PULL/DISCARD.
    Streaming,
    /// Inside an explicit transaction, idle.
    TxReady,
    /// Inside an explicit transaction, query running.
    TxStreaming,
    /// A request failed; everything but RESET/GOODBYE is IGNORED.
    Failed,
    /// An INTERRUPT signal was raised; everything is IGNORED until a RESET
    /// succeeds.
    Interrupted,
    /// Terminal. No further messages are permitted; the connection must be
    /// discarded.
    Defunct,
}

impl ServerState {
    /// Whether the connection sits inside an explicit transaction.
    pub fn is_tx(&self) -> bool {
        matches!(self, Self::TxReady | Self::TxStreaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Ready => "READY",
            Self::Streaming => "STREAMING",
            Self::TxReady => "TX_READY",
            Self::TxStreaming => "TX_STREAMING",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
            Self::Defunct => "DEFUNCT",
        }
    }
}

/// Request messages tracked by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoltMessage {
    Hello,
    Run,
    Pull,
    Discard,
    Begin,
    Commit,
    Rollback,
    Reset,
    Route,
    Goodbye,
}

/// An out-of-band control action associated with a transition, distinct from
/// the message payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Disconnect,
}

/// The kind of a server response summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    Failure,
    Ignored,
}

/// One row of the transition table: in `from`, sending `message` (optionally
/// raising `signal`) and receiving `response` moves the server to `to`.
///
/// `response`/`to` are `None` for transitions whose outcome depends on the
/// follow-up response (RESET raising INTERRUPT) or that have no response at
/// all (GOODBYE).
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: ServerState,
    pub message: BoltMessage,
    pub signal: Option<Signal>,
    pub response: Option<ResponseKind>,
    pub to: Option<ServerState>,
}

const fn row(
    from: ServerState,
    message: BoltMessage,
    signal: Option<Signal>,
    response: Option<ResponseKind>,
    to: Option<ServerState>,
) -> Transition {
    Transition {
        from,
        message,
        signal,
        response,
        to,
    }
}

use BoltMessage as M;
use ResponseKind as R;
use ServerState as S;
use Signal as G;

/// The complete transition table.
pub const TRANSITIONS: &[Transition] = &[
    row(S::Connected, M::Hello, None, Some(R::Success), Some(S::Ready)),
    row(S::Connected, M::Hello, None, Some(R::Failure), Some(S::Defunct)),
    //
    row(S::Ready, M::Run, None, Some(R::Success), Some(S::Streaming)),
    row(S::Ready, M::Run, None, Some(R::Failure), Some(S::Failed)),
    row(S::Ready, M::Begin, None, Some(R::Success), Some(S::TxReady)),
    row(S::Ready, M::Begin, None, Some(R::Failure), Some(S::Failed)),
    row(S::Ready, M::Route, None, Some(R::Success), Some(S::Ready)),
    row(S::Ready, M::Route, None, Some(R::Failure), Some(S::Failed)),
    row(S::Ready, M::Reset, Some(G::Interrupt), None, None),
    row(S::Ready, M::Goodbye, Some(G::Disconnect), None, Some(S::Defunct)),
    //
    row(S::Streaming, M::Pull, None, Some(R::Success), Some(S::Streaming)),
    row(S::Streaming, M::Pull, None, Some(R::Success), Some(S::Ready)),
    row(S::Streaming, M::Pull, None, Some(R::Failure), Some(S::Failed)),
    row(S::Streaming, M::Discard, None, Some(R::Success), Some(S::Streaming)),
    row(S::Streaming, M::Discard, None, Some(R::Success), Some(S::Ready)),
    row(S::Streaming, M::Discard, None, Some(R::Failure), Some(S::Failed)),
    row(S::Streaming, M::Reset, Some(G::Interrupt), None, None),
    row(S::Streaming, M::Goodbye, Some(G::Disconnect), None, Some(S::Defunct)),
    //
    row(S::TxReady, M::Run, None, Some(R::Success), Some(S::TxStreaming)),
    row(S::TxReady, M::Run, None, Some(R::Failure), Some(S::Failed)),
    row(S::TxReady, M::Commit, None, Some(R::Success), Some(S::Ready)),
    row(S::TxReady, M::Commit, None, Some(R::Failure), Some(S::Failed)),
    row(S::TxReady, M::Rollback, None, Some(R::Success), Some(S::Ready)),
    row(S::TxReady, M::Rollback, None, Some(R::Failure), Some(S::Failed)),
    row(S::TxReady, M::Reset, Some(G::Interrupt), None, None),
    row(S::TxReady, M::Goodbye, Some(G::Disconnect), None, Some(S::Defunct)),
    //
    row(S::TxStreaming, M::Run, None, Some(R::Success), Some(S::TxStreaming)),
    row(S::TxStreaming, M::Run, None, Some(R::Failure), Some(S::Failed)),
    row(S::TxStreaming, M::Pull, None, Some(R::Success), Some(S::TxStreaming)),
    row(S::TxStreaming, M::Pull, None, Some(R::Success), Some(S::TxReady)),
    row(S::TxStreaming, M::Pull, None, Some(R::Failure), Some(S::Failed)),
    row(S::TxStreaming, M::Discard, None, Some(R::Success), Some(S::TxStreaming)),
    row(S::TxStreaming, M::Discard, None, Some(R::Success), Some(S::TxReady)),
    row(S::TxStreaming, M::Discard, None, Some(R::Failure), Some(S::Failed)),
    row(S::TxStreaming, M::Reset, Some(G::Interrupt), None, None),
    row(S::TxStreaming, M::Goodbye, Some(G::Disconnect), None, Some(S::Defunct)),
    //
    row(S::Failed, M::Run, None, Some(R::Ignored), Some(S::Failed)),
    row(S::Failed, M::Pull, None, Some(R::Ignored), Some(S::Failed)),
    row(S::Failed, M::Discard, None, Some(R::Ignored), Some(S::Failed)),
    row(S::Failed, M::Reset, Some(G::Interrupt), None, None),
    row(S::Failed, M::Goodbye, Some(G::Disconnect), None, Some(S::Defunct)),
    //
    row(S::Interrupted, M::Run, None, Some(R::Ignored), Some(S::Interrupted)),
    row(S::Interrupted, M::Pull, None, Some(R::Ignored), Some(S::Interrupted)),
    row(S::Interrupted, M::Discard, None, Some(R::Ignored), Some(S::Interrupted)),
    row(S::Interrupted, M::Begin, None, Some(R::Ignored), Some(S::Interrupted)),
    row(S::Interrupted, M::Commit, None, Some(R::Ignored), Some(S::Interrupted)),
    row(S::Interrupted, M::Rollback, None, Some(R::Ignored), Some(S::Interrupted)),
    row(S::Interrupted, M::Reset, Some(G::Interrupt), Some(R::Success), Some(S::Ready)),
    row(S::Interrupted, M::Reset, Some(G::Interrupt), Some(R::Failure), Some(S::Defunct)),
    row(S::Interrupted, M::Goodbye, Some(G::Disconnect), None, Some(S::Defunct)),
];

/// Returns whether `message` may be sent while in `state`.
pub fn can_send_message(state: ServerState, message: BoltMessage) -> bool {
    TRANSITIONS
        .iter()
        .any(|t| t.from == state && t.message == message)
}

/// Returns whether `state` appears as an originating state in the table.
/// DEFUNCT has no outgoing transitions and is therefore not a valid state to
/// send from.
pub fn is_valid_state(state: ServerState) -> bool {
    TRANSITIONS.iter().any(|t| t.from == state)
}

/// Looks up the state the server will be in after answering `response` to
/// `message` sent from `state`. `None` when the table has no matching row
/// (e.g. RESET, whose outcome depends on the follow-up response).
pub fn expected_state_for_response(
    state: ServerState,
    message: BoltMessage,
    response: ResponseKind,
) -> Option<ServerState> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == state && t.message == message && t.response == Some(response))
        .and_then(|t| t.to)
}

/// Returns the signal raised by sending `message` from `state`, if any.
pub fn expected_signal_for_response(state: ServerState, message: BoltMessage) -> Option<Signal> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == state && t.message == message)
        .find_map(|t| t.signal)
}

/// The messages that may be sent from `state`.
pub fn messages_for_state(state: ServerState) -> Vec<BoltMessage> {
    let mut messages: Vec<BoltMessage> = TRANSITIONS
        .iter()
        .filter(|t| t.from == state)
        .map(|t| t.message)
        .collect();
    messages.dedup();
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ServerState; 8] = [
        S::Connected,
        S::Ready,
        S::Streaming,
        S::TxReady,
        S::TxStreaming,
        S::Failed,
        S::Interrupted,
        S::Defunct,
    ];

    const ALL_MESSAGES: [BoltMessage; 10] = [
        M::Hello,
        M::Run,
        M::Pull,
        M::Discard,
        M::Begin,
        M::Commit,
        M::Rollback,
        M::Reset,
        M::Route,
        M::Goodbye,
    ];

    #[test]
    fn legality_matches_table_membership() {
        for state in ALL_STATES {
            for message in ALL_MESSAGES {
                let in_table = TRANSITIONS
                    .iter()
                    .any(|t| t.from == state && t.message == message);
                assert_eq!(
                    can_send_message(state, message),
                    in_table,
                    "{state:?} {message:?}"
                );
            }
        }
    }

    #[test]
    fn table_rows_resolve_to_their_new_state() {
        for t in TRANSITIONS {
            let Some(response) = t.response else { continue };
            let targets: Vec<Option<ServerState>> = TRANSITIONS
                .iter()
                .filter(|o| {
                    o.from == t.from && o.message == t.message && o.response == t.response
                })
                .map(|o| o.to)
                .collect();
            let resolved = expected_state_for_response(t.from, t.message, response);
            if targets.len() == 1 {
                assert_eq!(resolved, t.to, "{t:?}");
            } else {
                // PULL/DISCARD SUCCESS is resolved by the summary's
                // `has_more`, not the table; the lookup still lands inside
                // the legal pair.
                assert!(targets.contains(&resolved), "{t:?}");
            }
        }
    }

    #[test]
    fn no_conflicting_rows() {
        for t in TRANSITIONS {
            let matches = TRANSITIONS
                .iter()
                .filter(|o| o.from == t.from && o.message == t.message && o.response == t.response)
                .filter(|o| o.response.is_some())
                .map(|o| o.to)
                .collect::<Vec<_>>();
            // PULL/DISCARD legitimately carry two SUCCESS targets; the pair
            // must be exactly {stay streaming, back to ready}.
            if matches.len() > 1 {
                assert!(matches!(t.message, M::Pull | M::Discard), "{t:?}");
                assert_eq!(matches.len(), 2, "{t:?}");
            }
        }
    }

    #[test]
    fn defunct_is_terminal() {
        assert!(!is_valid_state(S::Defunct));
        for message in ALL_MESSAGES {
            assert!(!can_send_message(S::Defunct, message));
        }
    }

    #[test]
    fn ready_accepts_run_begin_route_reset_goodbye() {
        assert!(can_send_message(S::Ready, M::Run));
        assert!(can_send_message(S::Ready, M::Begin));
        assert!(can_send_message(S::Ready, M::Route));
        assert!(can_send_message(S::Ready, M::Reset));
        assert!(can_send_message(S::Ready, M::Goodbye));
        assert!(!can_send_message(S::Ready, M::Pull));
        assert!(!can_send_message(S::Ready, M::Commit));
    }

    #[test]
    fn hello_from_connected() {
        assert_eq!(
            expected_state_for_response(S::Connected, M::Hello, R::Success),
            Some(S::Ready)
        );
        assert_eq!(
            expected_state_for_response(S::Connected, M::Hello, R::Failure),
            Some(S::Defunct)
        );
    }

    #[test]
    fn failed_ignores_until_reset() {
        assert_eq!(
            expected_state_for_response(S::Failed, M::Run, R::Ignored),
            Some(S::Failed)
        );
        assert_eq!(
            expected_state_for_response(S::Failed, M::Pull, R::Ignored),
            Some(S::Failed)
        );
        assert!(can_send_message(S::Failed, M::Reset));
        assert!(!can_send_message(S::Failed, M::Begin));
    }

    #[test]
    fn interrupted_reset_resolves_by_response() {
        assert_eq!(
            expected_state_for_response(S::Interrupted, M::Reset, R::Success),
            Some(S::Ready)
        );
        assert_eq!(
            expected_state_for_response(S::Interrupted, M::Reset, R::Failure),
            Some(S::Defunct)
        );
        assert_eq!(
            expected_state_for_response(S::Interrupted, M::Begin, R::Ignored),
            Some(S::Interrupted)
        );
    }

    #[test]
    fn reset_raises_interrupt_signal() {
        for state in [S::Ready, S::Streaming, S::TxReady, S::TxStreaming, S::Failed] {
            assert_eq!(
                expected_signal_for_response(state, M::Reset),
                Some(G::Interrupt),
                "{state:?}"
            );
        }
        assert_eq!(expected_signal_for_response(S::Ready, M::Run), None);
    }

    #[test]
    fn goodbye_raises_disconnect_and_defuncts() {
        assert_eq!(
            expected_signal_for_response(S::Ready, M::Goodbye),
            Some(G::Disconnect)
        );
        let row = TRANSITIONS
            .iter()
            .find(|t| t.from == S::Ready && t.message == M::Goodbye)
            .unwrap();
        assert_eq!(row.to, Some(S::Defunct));
    }

    #[test]
    fn reset_without_follow_up_has_no_expected_state() {
        assert_eq!(
            expected_state_for_response(S::Ready, M::Reset, R::Success),
            None
        );
    }

    #[test]
    fn messages_for_state_lists_table_entries() {
        let ready = messages_for_state(S::Ready);
        assert!(ready.contains(&M::Run));
        assert!(ready.contains(&M::Begin));
        assert!(!ready.contains(&M::Pull));
        assert!(messages_for_state(S::Defunct).is_empty());
    }
}
