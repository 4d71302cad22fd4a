//! Job types for the controller's background spooler.
//!
//! A job is any callable that is invoked with the controller over and over
//! until it reports completion by returning `Ok(true)`. Returning
//! `Ok(false)` means "call me again immediately", which lets a job act as
//! a small state machine or drain a command stream one element at a time.

use std::io;
use std::sync::{Arc, Mutex};

use crate::controller::GalvoController;

/// A spooled unit of work. Jobs are compared by identity for removal, so
/// keep the `Arc` returned by the constructors around if you intend to
/// remove one later.
pub type Job = Arc<dyn Fn(&GalvoController) -> io::Result<bool> + Send + Sync>;

/// One queued controller operation for a streamed job.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Mark(i32, i32),
    Goto(i32, i32),
    Light(i32, i32),
    Dark(i32, i32),
    /// Laser-on dwell, in ms.
    Dwell(f64),
    /// Laser-off wait, in ms.
    Wait(f64),
    LightOn,
    LightOff,
    /// Immediate reposition outside of list context.
    SetXy(u16, u16),
    /// Block until the masked input bits hold the given value.
    WaitForInput(u16, u16),
    MarkingConfiguration,
    LightingConfiguration,
    InitialConfiguration,
    WritePort,
}

impl Command {
    pub(crate) fn apply(self, controller: &GalvoController) -> io::Result<()> {
        match self {
            Command::Mark(x, y) => controller.mark(x, y),
            Command::Goto(x, y) => controller.goto(x, y),
            Command::Light(x, y) => controller.light(x, y),
            Command::Dark(x, y) => controller.dark(x, y),
            Command::Dwell(ms) => controller.dwell(ms),
            Command::Wait(ms) => controller.wait(ms),
            Command::LightOn => {
                controller.light_on();
                Ok(())
            }
            Command::LightOff => {
                controller.light_off();
                Ok(())
            }
            Command::SetXy(x, y) => controller.set_xy(x, y).map(|_| ()),
            Command::WaitForInput(mask, value) => controller.wait_for_input(mask, value),
            Command::MarkingConfiguration => controller.marking_configuration(),
            Command::LightingConfiguration => controller.lighting_configuration(),
            Command::InitialConfiguration => controller.initial_configuration(),
            Command::WritePort => controller.write_port().map(|_| ()),
        }
    }
}

/// Wrap a finite or infinite stream of [`Command`]s into a [`Job`]. Each
/// invocation dispatches one command; the job completes when the stream is
/// exhausted.
pub fn command_stream_job<I>(commands: I) -> Job
where
    I: IntoIterator<Item = Command>,
    I::IntoIter: Send + 'static,
{
    let stream = Mutex::new(commands.into_iter());
    Arc::new(move |controller: &GalvoController| {
        let next = stream.lock().unwrap().next();
        match next {
            Some(command) => {
                command.apply(controller)?;
                Ok(false)
            }
            None => Ok(true),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use crate::consts::{LIST_DELAY_TIME, LIST_JUMP_TO};
    use crate::settings::Settings;

    #[test]
    fn stream_job_dispatches_one_command_per_call() {
        let mock = MockConnection::new();
        let controller =
            GalvoController::with_connection(Settings::default(), Box::new(mock.clone()));
        let job = command_stream_job(vec![
            Command::LightingConfiguration,
            Command::Dark(0x2000, 0x2000),
            Command::Wait(500.0),
            Command::InitialConfiguration,
        ]);

        assert_eq!(job(&controller).unwrap(), false);
        assert_eq!(job(&controller).unwrap(), false);
        assert_eq!(job(&controller).unwrap(), false);
        assert_eq!(job(&controller).unwrap(), false);
        // stream exhausted
        assert_eq!(job(&controller).unwrap(), true);

        let words = mock.list_words();
        assert!(words.iter().any(|w| w[0] == LIST_JUMP_TO));
        assert!(
            words
                .iter()
                .any(|w| w[0] == LIST_DELAY_TIME && w[1] == 50000)
        );
    }
}
