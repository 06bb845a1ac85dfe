//! Read and write state machines of a client connection.
//!
//! The write machine is a pure transition function: given its state and a
//! snapshot of the connection, it returns the next state and one action for
//! the connection to perform. All side effects (drawing samples, arming
//! timers, writing bytes) stay in `Connection`.

use super::operation::OpKind;
use std::time::Instant;

/// Response side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Transport not yet connected.
    InitRead,
    /// Protocol handshake in progress.
    ConnSetup,
    /// Warm-up writes in flight.
    Loading,
    /// Connected with nothing outstanding.
    Idle,
    WaitingForGet,
    WaitingForPost,
}

/// Issuance side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    InitWrite,
    Issuing,
    WaitingForTime,
    WaitingForOpq,
}

/// Snapshot the write machine decides on.
#[derive(Debug, Clone, Copy)]
pub struct WriteInputs {
    pub now: Instant,
    pub next_time: Option<Instant>,
    pub outstanding: usize,
    pub depth: usize,
    /// Earliest issue instant imposed by moderation, if any.
    pub moderate_until: Option<Instant>,
    /// Deadline of the timer currently armed, if any.
    pub timer: Option<Instant>,
    /// The exit condition holds.
    pub exit: bool,
}

/// What the connection must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    /// Step again.
    Continue,
    /// Nothing to do until an external event.
    Yield,
    /// Arm the timer for this instant, then yield.
    ArmTimer(Instant),
    /// Draw the first inter-arrival gap into `next_time`, then step again.
    Schedule,
    /// Issue one operation, then step again.
    Issue,
}

impl WriteAction {
    /// Whether the drive loop stops after performing this action.
    pub fn is_terminal(self) -> bool {
        matches!(self, WriteAction::Yield | WriteAction::ArmTimer(_))
    }
}

/// One transition of the write machine.
pub fn write_step(state: WriteState, inputs: &WriteInputs) -> (WriteState, WriteAction) {
    match state {
        WriteState::InitWrite => (WriteState::WaitingForTime, WriteAction::Schedule),
        WriteState::Issuing => {
            if inputs.outstanding >= inputs.depth {
                return (WriteState::WaitingForOpq, WriteAction::Yield);
            }
            if inputs.exit {
                return (WriteState::Issuing, WriteAction::Yield);
            }
            match inputs.next_time {
                Some(next) if inputs.now < next => {
                    return (WriteState::WaitingForTime, WriteAction::Continue)
                }
                None => return (WriteState::InitWrite, WriteAction::Continue),
                _ => {}
            }
            if let Some(until) = inputs.moderate_until {
                if inputs.now < until {
                    return (WriteState::WaitingForTime, WriteAction::ArmTimer(until));
                }
            }
            (WriteState::Issuing, WriteAction::Issue)
        }
        WriteState::WaitingForTime => match inputs.next_time {
            Some(next) if inputs.now < next => {
                let armed = inputs.timer.is_some_and(|deadline| deadline <= next);
                if armed {
                    (WriteState::WaitingForTime, WriteAction::Yield)
                } else {
                    (WriteState::WaitingForTime, WriteAction::ArmTimer(next))
                }
            }
            Some(_) => (WriteState::Issuing, WriteAction::Continue),
            None => (WriteState::InitWrite, WriteAction::Continue),
        },
        WriteState::WaitingForOpq => {
            if inputs.outstanding >= inputs.depth {
                (WriteState::WaitingForOpq, WriteAction::Yield)
            } else {
                (WriteState::Issuing, WriteAction::Continue)
            }
        }
    }
}

/// Read state once the front of the queue is `front`.
pub fn read_state_for(front: Option<OpKind>) -> ReadState {
    match front {
        None => ReadState::Idle,
        Some(OpKind::Get) => ReadState::WaitingForGet,
        Some(OpKind::Post) => ReadState::WaitingForPost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inputs(now: Instant) -> WriteInputs {
        WriteInputs {
            now,
            next_time: Some(now),
            outstanding: 0,
            depth: 2,
            moderate_until: None,
            timer: None,
            exit: false,
        }
    }

    #[test]
    fn test_init_schedules() {
        let now = Instant::now();
        assert_eq!(
            write_step(WriteState::InitWrite, &inputs(now)),
            (WriteState::WaitingForTime, WriteAction::Schedule)
        );
    }

    #[test]
    fn test_issuing_paths() {
        let now = Instant::now();
        let mut i = inputs(now);
        assert_eq!(
            write_step(WriteState::Issuing, &i),
            (WriteState::Issuing, WriteAction::Issue)
        );

        i.outstanding = 2;
        assert_eq!(
            write_step(WriteState::Issuing, &i),
            (WriteState::WaitingForOpq, WriteAction::Yield)
        );

        i.outstanding = 0;
        i.next_time = Some(now + Duration::from_millis(1));
        assert_eq!(
            write_step(WriteState::Issuing, &i),
            (WriteState::WaitingForTime, WriteAction::Continue)
        );

        i.next_time = Some(now);
        let until = now + Duration::from_micros(250);
        i.moderate_until = Some(until);
        assert_eq!(
            write_step(WriteState::Issuing, &i),
            (WriteState::WaitingForTime, WriteAction::ArmTimer(until))
        );

        i.moderate_until = None;
        i.exit = true;
        assert_eq!(
            write_step(WriteState::Issuing, &i),
            (WriteState::Issuing, WriteAction::Yield)
        );

        // A full pipeline wins over the exit condition.
        i.outstanding = 2;
        assert_eq!(
            write_step(WriteState::Issuing, &i),
            (WriteState::WaitingForOpq, WriteAction::Yield)
        );
    }

    #[test]
    fn test_waiting_for_time_arms_once() {
        let now = Instant::now();
        let next = now + Duration::from_millis(5);
        let mut i = inputs(now);
        i.next_time = Some(next);
        assert_eq!(
            write_step(WriteState::WaitingForTime, &i),
            (WriteState::WaitingForTime, WriteAction::ArmTimer(next))
        );

        i.timer = Some(next);
        assert_eq!(
            write_step(WriteState::WaitingForTime, &i),
            (WriteState::WaitingForTime, WriteAction::Yield)
        );

        // A timer later than the schedule must be pulled in.
        i.timer = Some(next + Duration::from_millis(1));
        assert_eq!(
            write_step(WriteState::WaitingForTime, &i),
            (WriteState::WaitingForTime, WriteAction::ArmTimer(next))
        );

        i.now = next;
        assert_eq!(
            write_step(WriteState::WaitingForTime, &i),
            (WriteState::Issuing, WriteAction::Continue)
        );
    }

    #[test]
    fn test_waiting_for_opq() {
        let now = Instant::now();
        let mut i = inputs(now);
        i.outstanding = 2;
        assert_eq!(
            write_step(WriteState::WaitingForOpq, &i),
            (WriteState::WaitingForOpq, WriteAction::Yield)
        );
        i.outstanding = 1;
        assert_eq!(
            write_step(WriteState::WaitingForOpq, &i),
            (WriteState::Issuing, WriteAction::Continue)
        );
    }

    /// Without issuing, every state reaches a terminal action in a few steps.
    #[test]
    fn test_non_issuing_paths_terminate() {
        let now = Instant::now();
        let cases = [
            (Some(now + Duration::from_millis(1)), 0, None),
            (Some(now), 2, None),
            (Some(now), 0, Some(now + Duration::from_micros(100))),
        ];
        for (next_time, outstanding, moderate_until) in cases {
            for start in [
                WriteState::Issuing,
                WriteState::WaitingForTime,
                WriteState::WaitingForOpq,
            ] {
                let i = WriteInputs {
                    next_time,
                    outstanding,
                    moderate_until,
                    ..inputs(now)
                };
                let mut state = start;
                let mut steps = 0;
                loop {
                    let (next, action) = write_step(state, &i);
                    state = next;
                    steps += 1;
                    assert_ne!(action, WriteAction::Issue);
                    if action.is_terminal() {
                        break;
                    }
                    assert!(steps < 8, "no terminal action from {:?}", start);
                }
            }
        }
    }

    #[test]
    fn test_read_state_for_front() {
        assert_eq!(read_state_for(None), ReadState::Idle);
        assert_eq!(read_state_for(Some(OpKind::Get)), ReadState::WaitingForGet);
        assert_eq!(read_state_for(Some(OpKind::Post)), ReadState::WaitingForPost);
    }
}
