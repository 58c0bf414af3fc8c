use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use tracing::trace;

/// An administrative command for the pool, applied off the ordinary work
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
  SetThreadCount(usize),
}

/// The serialized side-channel for administrative commands.
///
/// Commands are appended by any thread and drained by whichever thread holds
/// the processing token, in submission order, one at a time. Ordinary work is
/// never routed through here, so a long resize cannot be interleaved with
/// another administrative command, and `set_thread_count` stays asynchronous
/// from the caller's point of view: if another thread already holds the
/// token, pushing returns immediately and that thread applies the command.
pub(crate) struct Controller {
  commands: Mutex<VecDeque<ControlCommand>>,
  active: AtomicBool,
}

impl Controller {
  pub(crate) fn new() -> Self {
    Self {
      commands: Mutex::new(VecDeque::new()),
      active: AtomicBool::new(false),
    }
  }

  pub(crate) fn push(&self, command: ControlCommand) {
    self.commands.lock().push_back(command);
  }

  /// Drains queued commands through `apply` if the processing token is free.
  ///
  /// The re-check after releasing the token closes the window where another
  /// thread pushed a command right after this drain saw an empty queue; that
  /// command must not sit unprocessed until the next unrelated pump.
  pub(crate) fn pump(&self, mut apply: impl FnMut(ControlCommand)) {
    loop {
      if self
        .active
        .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
        .is_err()
      {
        trace!("control queue busy; command left for the active processor");
        return;
      }
      loop {
        let command = self.commands.lock().pop_front();
        match command {
          Some(command) => apply(command),
          None => break,
        }
      }
      self.active.store(false, AtomicOrdering::SeqCst);
      if self.commands.lock().is_empty() {
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_commands_apply_in_submission_order() {
    let controller = Controller::new();
    controller.push(ControlCommand::SetThreadCount(4));
    controller.push(ControlCommand::SetThreadCount(1));
    controller.push(ControlCommand::SetThreadCount(8));

    let mut applied = Vec::new();
    controller.pump(|command| applied.push(command));

    assert_eq!(
      applied,
      vec![
        ControlCommand::SetThreadCount(4),
        ControlCommand::SetThreadCount(1),
        ControlCommand::SetThreadCount(8),
      ]
    );
  }

  #[test]
  fn test_command_pushed_during_drain_is_picked_up() {
    let controller = Controller::new();
    controller.push(ControlCommand::SetThreadCount(2));

    let mut applied = Vec::new();
    let mut reentered = false;
    controller.pump(|command| {
      applied.push(command);
      if !reentered {
        reentered = true;
        controller.push(ControlCommand::SetThreadCount(6));
      }
    });

    assert_eq!(
      applied,
      vec![ControlCommand::SetThreadCount(2), ControlCommand::SetThreadCount(6)]
    );
  }

  #[test]
  fn test_pump_with_empty_queue_is_a_no_op() {
    let controller = Controller::new();
    let mut applied = 0;
    controller.pump(|_| applied += 1);
    assert_eq!(applied, 0);
  }
}
