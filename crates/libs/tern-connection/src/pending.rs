//! Pending-command correlation table.
//!
//! Each in-flight command owns a one-shot completion channel; resolution
//! consumes the sender, so delivering twice is unrepresentable. The table is
//! only ever touched under the connection's serial context.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use tern_wire::{Frame, PUSH_SERIAL};

use crate::error::CommandError;

/// What happens to an in-flight command when the transport drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResendPolicy {
    /// Resolve with a transport error the moment the link is lost.
    #[default]
    FailFast,
    /// Stay pending across the gap; the encoded frame is re-sent after the
    /// next successful reconnect. The TTL deadline still applies.
    ReplayOnReconnect,
}

pub(crate) type Completion = oneshot::Sender<Result<Frame, CommandError>>;

struct PendingCommand {
    tx: Completion,
    deadline: Instant,
    /// Encoded frame retained for replay; `None` for fail-fast commands.
    replay: Option<Vec<u8>>,
}

pub(crate) struct PendingTable {
    next_serial: u32,
    commands: HashMap<u32, PendingCommand>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self { next_serial: 1, commands: HashMap::new() }
    }

    /// Allocate the next correlation serial, skipping the push sentinel.
    pub(crate) fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = match self.next_serial.wrapping_add(1) {
            PUSH_SERIAL => 1,
            next => next,
        };
        serial
    }

    pub(crate) fn insert(
        &mut self,
        serial: u32,
        deadline: Instant,
        resend: ResendPolicy,
        frame_bytes: &[u8],
    ) -> oneshot::Receiver<Result<Frame, CommandError>> {
        let (tx, rx) = oneshot::channel();
        let replay = match resend {
            ResendPolicy::FailFast => None,
            ResendPolicy::ReplayOnReconnect => Some(frame_bytes.to_vec()),
        };
        self.commands.insert(serial, PendingCommand { tx, deadline, replay });
        rx
    }

    /// Deliver `result` to the command with `serial`. Returns the result back
    /// when no such command is pending (already resolved, or never ours).
    pub(crate) fn complete(
        &mut self,
        serial: u32,
        result: Result<Frame, CommandError>,
    ) -> Option<Result<Frame, CommandError>> {
        match self.commands.remove(&serial) {
            Some(command) => {
                let _ = command.tx.send(result);
                None
            }
            None => Some(result),
        }
    }

    /// Resolve every command past its deadline with `Timeout`.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .commands
            .iter()
            .filter(|(_, command)| command.deadline <= now)
            .map(|(serial, _)| *serial)
            .collect();
        for serial in &expired {
            if let Some(command) = self.commands.remove(serial) {
                let _ = command.tx.send(Err(CommandError::Timeout));
            }
        }
        expired.len()
    }

    /// The transport dropped: fail-fast commands resolve with `error` now;
    /// replayable commands stay pending for the next link.
    pub(crate) fn fail_disconnected(&mut self, error: &CommandError) -> usize {
        let failed: Vec<u32> = self
            .commands
            .iter()
            .filter(|(_, command)| command.replay.is_none())
            .map(|(serial, _)| *serial)
            .collect();
        for serial in &failed {
            if let Some(command) = self.commands.remove(serial) {
                let _ = command.tx.send(Err(error.clone()));
            }
        }
        failed.len()
    }

    /// Resolve everything with `Cancelled` and empty the table.
    pub(crate) fn cancel_all(&mut self) {
        for (_, command) in self.commands.drain() {
            let _ = command.tx.send(Err(CommandError::Cancelled));
        }
    }

    /// Encoded frames of commands awaiting replay after a reconnect.
    pub(crate) fn replay_frames(&self) -> Vec<Vec<u8>> {
        self.commands.values().filter_map(|command| command.replay.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tern_wire::Opcode;

    fn frame(serial: u32) -> Frame {
        Frame::new(Opcode::Pong, serial, Vec::new())
    }

    #[tokio::test]
    async fn serial_allocation_skips_push_sentinel() {
        let mut table = PendingTable::new();
        table.next_serial = u32::MAX;
        assert_eq!(table.next_serial(), u32::MAX);
        assert_eq!(table.next_serial(), 1);
    }

    #[tokio::test]
    async fn complete_delivers_exactly_once() {
        let mut table = PendingTable::new();
        let serial = table.next_serial();
        let rx = table.insert(serial, Instant::now(), ResendPolicy::FailFast, &[]);

        assert!(table.complete(serial, Ok(frame(serial))).is_none());
        // Second delivery finds no pending entry and hands the result back.
        assert!(table.complete(serial, Ok(frame(serial))).is_some());

        let delivered = rx.await.expect("resolved").expect("response");
        assert_eq!(delivered.serial, serial);
    }

    #[tokio::test]
    async fn sweep_resolves_only_expired() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let s1 = table.next_serial();
        let rx1 = table.insert(s1, now, ResendPolicy::FailFast, &[]);
        let s2 = table.next_serial();
        let _rx2 = table.insert(s2, now + Duration::from_secs(30), ResendPolicy::FailFast, &[]);

        assert_eq!(table.sweep(now), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(rx1.await.expect("resolved"), Err(CommandError::Timeout));
    }

    #[tokio::test]
    async fn disconnect_keeps_replayable_commands() {
        let mut table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let s1 = table.next_serial();
        let rx1 = table.insert(s1, deadline, ResendPolicy::FailFast, b"one");
        let s2 = table.next_serial();
        let _rx2 = table.insert(s2, deadline, ResendPolicy::ReplayOnReconnect, b"two");

        let error = CommandError::Transport("gone".to_owned());
        assert_eq!(table.fail_disconnected(&error), 1);
        assert_eq!(rx1.await.expect("resolved"), Err(error));
        assert_eq!(table.replay_frames(), vec![b"two".to_vec()]);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_empties_table() {
        let mut table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let s1 = table.next_serial();
        let rx1 = table.insert(s1, deadline, ResendPolicy::FailFast, &[]);
        let s2 = table.next_serial();
        let rx2 = table.insert(s2, deadline, ResendPolicy::ReplayOnReconnect, b"replay");

        table.cancel_all();
        assert_eq!(table.len(), 0);
        assert_eq!(rx1.await.expect("resolved"), Err(CommandError::Cancelled));
        assert_eq!(rx2.await.expect("resolved"), Err(CommandError::Cancelled));
    }
}
