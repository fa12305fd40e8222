use std::fmt;

// Per-session finite state machine. The initiator walks
// SmiInit -> SmiInitWait -> SmiAuthWait -> Mature, the responder
// SmrInit -> SmrAuth -> Mature; both end in Terminate -> Dead.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Idle,
    SmiInit,
    SmiInitWait,
    SmiAuthWait,
    SmrInit,
    SmrAuth,
    Mature,
    Terminate,
    Dead,
}

impl State {
    pub fn is_established(&self) -> bool {
        *self == State::Mature
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, State::Terminate | State::Dead)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::SmiInit => "SMI_INIT",
            Self::SmiInitWait => "SMI_INIT_WAIT",
            Self::SmiAuthWait => "SMI_AUTH_WAIT",
            Self::SmrInit => "SMR_INIT",
            Self::SmrAuth => "SMR_AUTH",
            Self::Mature => "MATURE",
            Self::Terminate => "TERMINATE",
            Self::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    // External triggers.
    Connect,
    Accept,
    InitResponseOk,
    InitRetry,
    AuthResponseOk,
    AuthRequestOk,
    NoProposalChosen,
    AuthFailed,
    PeerDelete,
    // Internal triggers.
    RekeyDue,
    Timeout,
    Close,
    Finished,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Accept => "ACCEPT",
            Self::InitResponseOk => "INIT_RESPONSE_OK",
            Self::InitRetry => "INIT_RETRY",
            Self::AuthResponseOk => "AUTH_RESPONSE_OK",
            Self::AuthRequestOk => "AUTH_REQUEST_OK",
            Self::NoProposalChosen => "NO_PROPOSAL_CHOSEN",
            Self::AuthFailed => "AUTH_FAILED",
            Self::PeerDelete => "PEER_DELETE",
            Self::RekeyDue => "REKEY_DUE",
            Self::Timeout => "TIMEOUT",
            Self::Close => "CLOSE",
            Self::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

// Returns the next state, or None when the event is not valid in the
// current state (callers drop the event and log it).
pub fn transition(state: State, event: Event) -> Option<State> {
    match (state, event) {
        (State::SmiInit, Event::Connect) => Some(State::SmiInitWait),
        (State::SmiInitWait, Event::InitRetry) => Some(State::SmiInitWait),
        (State::SmiInitWait, Event::InitResponseOk) => Some(State::SmiAuthWait),
        (State::SmiAuthWait, Event::AuthResponseOk) => Some(State::Mature),
        (State::SmrInit, Event::Accept) => Some(State::SmrAuth),
        (State::SmrAuth, Event::AuthRequestOk) => Some(State::Mature),
        (State::Mature, Event::RekeyDue) => Some(State::Terminate),
        (State::Mature, Event::PeerDelete) => Some(State::Terminate),
        (_, Event::Timeout) => Some(State::Dead),
        (State::Dead, Event::Close) => Some(State::Dead),
        (_, Event::Close) => Some(State::Terminate),
        (_, Event::NoProposalChosen) => Some(State::Terminate),
        (_, Event::AuthFailed) => Some(State::Terminate),
        (State::Terminate, Event::Finished) => Some(State::Dead),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_happy_path() {
        let mut state = State::SmiInit;
        for (event, expected) in [
            (Event::Connect, State::SmiInitWait),
            (Event::InitRetry, State::SmiInitWait),
            (Event::InitResponseOk, State::SmiAuthWait),
            (Event::AuthResponseOk, State::Mature),
            (Event::RekeyDue, State::Terminate),
            (Event::Finished, State::Dead),
        ] {
            state = transition(state, event).expect("valid transition");
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn responder_happy_path() {
        let mut state = State::SmrInit;
        for (event, expected) in [
            (Event::Accept, State::SmrAuth),
            (Event::AuthRequestOk, State::Mature),
            (Event::PeerDelete, State::Terminate),
            (Event::Finished, State::Dead),
        ] {
            state = transition(state, event).expect("valid transition");
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn out_of_order_messages_are_rejected() {
        assert_eq!(transition(State::SmiInit, Event::AuthResponseOk), None);
        assert_eq!(transition(State::SmiInitWait, Event::AuthRequestOk), None);
        assert_eq!(transition(State::Mature, Event::InitResponseOk), None);
        assert_eq!(transition(State::SmrAuth, Event::Accept), None);
    }

    #[test]
    fn failures_terminate_from_any_live_state() {
        for state in [
            State::SmiInitWait,
            State::SmiAuthWait,
            State::SmrAuth,
            State::Mature,
        ] {
            assert_eq!(
                transition(state, Event::AuthFailed),
                Some(State::Terminate)
            );
            assert_eq!(transition(state, Event::Timeout), Some(State::Dead));
        }
    }
}
