use async_trait::async_trait;

use crate::{
    engine::CounterSnapshot,
    error::{Error, Result},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModuleState {
    /// Created, or scrapped by `unconfigure`.
    #[default]
    Initial,
    /// Configured and stopped.
    Configured,
    Running,
}

/// A lifecycle command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Configure,
    Start,
    Stop,
    Unconfigure,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Configure => "configure",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Unconfigure => "unconfigure",
        }
    }
}

impl ModuleState {
    /// Where `command` takes a module in this state. `Ok(None)` means the
    /// command has nothing to do, as with stopping a module that isn't
    /// running.
    pub fn apply(self, command: Command) -> Result<Option<ModuleState>> {
        use Command::*;
        use ModuleState::*;
        match (self, command) {
            (Initial | Configured, Configure) => Ok(Some(Configured)),
            (Configured, Start) => Ok(Some(Running)),
            (Running, Stop) => Ok(Some(Configured)),
            (Initial | Configured, Stop) => Ok(None),
            (Configured, Unconfigure) => Ok(Some(Initial)),
            (Initial, Unconfigure) => Ok(None),
            (state, command) => Err(Error::InvalidTransition {
                command: command.as_str(),
                state,
            }),
        }
    }
}

/// Something the process framework can configure, start and stop.
///
/// `configure` is only accepted while the module isn't running, `start`
/// only once it is configured. `stop` on a module that isn't running is a
/// no-op, and `unconfigure` drops the configuration so the module can be
/// configured from scratch.
#[async_trait]
pub trait Module: Send {
    type Conf: Send;

    fn name(&self) -> &str;

    fn state(&self) -> ModuleState;

    async fn configure(&mut self, conf: Self::Conf) -> Result<()>;

    /// Fails with `ConnectionUnavailable` if a required endpoint can't be
    /// reached.
    async fn start(&mut self) -> Result<()>;

    /// Bounded in time: never waits forever on a straggler.
    async fn stop(&mut self) -> Result<()>;

    async fn unconfigure(&mut self) -> Result<()>;

    /// Pulls the counters, resetting their since-last-read halves.
    fn info(&self) -> CounterSnapshot;
}

#[cfg(test)]
mod tests {
    use super::{Command::*, ModuleState::*, *};

    #[test]
    fn full_cycle() {
        let mut state = Initial;
        for command in [Configure, Start, Stop, Start, Stop, Unconfigure] {
            if let Some(next) = state.apply(command).unwrap() {
                state = next;
            }
        }
        assert_eq!(state, Initial);
    }

    #[test]
    fn stop_is_a_no_op_unless_running() {
        assert_eq!(Initial.apply(Stop).unwrap(), None);
        assert_eq!(Configured.apply(Stop).unwrap(), None);
    }

    #[test]
    fn rejects_invalid_transitions() {
        for (state, command) in [
            (Initial, Start),
            (Running, Start),
            (Running, Configure),
            (Running, Unconfigure),
        ] {
            match state.apply(command) {
                Err(Error::InvalidTransition { state: s, .. }) => {
                    assert_eq!(s, state)
                }
                other => panic!("{:?} on {:?} gave {:?}", command, state, other),
            }
        }
    }
}
