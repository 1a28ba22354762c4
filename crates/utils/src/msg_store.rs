use std::{
    io,
    sync::{Arc, Mutex},
};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::log_msg::LogMsg;

const BROADCAST_CAPACITY: usize = 1024;

/// In-process fan-out primitive backing the log pipeline.
///
/// Every [`LogMsg`] pushed is appended to an in-memory history (so a
/// subscriber joining mid-run can replay everything so far) and broadcast to
/// any live subscribers. A subscriber that falls behind the broadcast
/// channel's bounded capacity observes a gap (surfaced as an `io::Error`) and
/// is expected to drop itself rather than block the pusher — the pusher
/// itself never waits on subscribers. `push` is synchronous: it only takes a
/// short-lived std mutex around an in-memory `Vec`, never an await point, so
/// callers on both async and sync paths (e.g. a container-output reader loop)
/// can call it directly.
pub struct MsgStore {
    history: Mutex<Vec<LogMsg>>,
    sender: broadcast::Sender<LogMsg>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            history: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Append a message to history and publish it to current subscribers.
    ///
    /// Publication is best-effort: `send` only fails when there are zero
    /// receivers, which is not an error for the pusher (nobody is watching
    /// live; the append to history already happened).
    pub fn push(&self, msg: LogMsg) {
        self.history.lock().unwrap().push(msg.clone());
        let _ = self.sender.send(msg);
    }

    pub fn push_finished(&self) {
        self.push(LogMsg::Finished);
    }

    pub fn history_snapshot(&self) -> Vec<LogMsg> {
        self.history.lock().unwrap().clone()
    }

    /// Replay-then-live stream: every message seen so far, followed by every
    /// message published after the subscription was taken. A subscriber that
    /// lags past `BROADCAST_CAPACITY` entries sees the gap as an `io::Error`
    /// and should treat the stream as ended.
    pub fn history_plus_stream(self: &Arc<Self>) -> BoxStream<'static, Result<LogMsg, io::Error>> {
        let history = self.history_snapshot();
        let rx = self.sender.subscribe();

        let replay = stream::iter(history.into_iter().map(Ok));
        let live = BroadcastStream::new(rx).map(|res| {
            res.map_err(|e| io::Error::new(io::ErrorKind::Other, format!("log stream lagged: {e}")))
        });

        replay.chain(live).boxed()
    }
}
