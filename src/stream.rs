use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::model::{StreamChannel, StreamEvent};
use crate::runner::AllowList;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Per-stream-id broadcast channels.
///
/// There is no backpressure: a subscriber that falls more than the channel
/// capacity behind observes `RecvError::Lagged` and misses those events.
#[derive(Debug)]
struct StreamHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl StreamHub {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, stream_id: &str) -> broadcast::Sender<StreamEvent> {
        self.channels
            .lock()
            .entry(stream_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn detach(&self, stream_id: &str, sender: &broadcast::Sender<StreamEvent>) {
        let mut channels = self.channels.lock();
        if channels
            .get(stream_id)
            .is_some_and(|current| current.same_channel(sender))
        {
            channels.remove(stream_id);
        }
    }
}

#[derive(Debug)]
struct ActiveStream {
    generation: u64,
    command: String,
    started_at: DateTime<Utc>,
    kill: CancellationToken,
    events: broadcast::Sender<StreamEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub stream_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StreamState {
    allow_list: AllowList,
    hub: StreamHub,
    active: Mutex<HashMap<String, ActiveStream>>,
    generation: AtomicU64,
}

/// Spawns long-lived commands and publishes their output incrementally.
#[derive(Debug, Clone)]
pub struct StreamRunner {
    state: Arc<StreamState>,
}

impl StreamRunner {
    pub fn new(allow_list: AllowList, channel_capacity: usize) -> Self {
        Self {
            state: Arc::new(StreamState {
                allow_list,
                hub: StreamHub::new(channel_capacity),
                active: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, stream_id: &str) -> StreamSubscription {
        StreamSubscription {
            stream_id: stream_id.to_string(),
            receiver: Some(self.state.hub.sender(stream_id).subscribe()),
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_active(&self, stream_id: &str) -> bool {
        self.state.active.lock().contains_key(stream_id)
    }

    pub fn active_streams(&self) -> Vec<StreamSummary> {
        let mut streams = self
            .state
            .active
            .lock()
            .iter()
            .map(|(stream_id, stream)| StreamSummary {
                stream_id: stream_id.clone(),
                command: stream.command.clone(),
                started_at: stream.started_at,
            })
            .collect::<Vec<_>>();
        streams.sort_by(|left, right| left.started_at.cmp(&right.started_at));
        streams
    }

    /// Acknowledges immediately; output, exit and spawn failures arrive on
    /// the stream's channel.
    pub fn start(&self, command: &str, stream_id: &str) -> Result<(), ExecError> {
        self.state.allow_list.check(command)?;
        let args = shell_words::split(command)
            .map_err(|error| ExecError::InvalidCommand(error.to_string()))?;
        let Some((program, rest)) = args.split_first() else {
            return Err(ExecError::Validation {
                executable: self.state.allow_list.executable().to_string(),
            });
        };

        let mut active = self.state.active.lock();
        if active.contains_key(stream_id) {
            return Err(ExecError::StreamConflict(stream_id.to_string()));
        }

        let events = self.state.hub.sender(stream_id);
        let child = TokioCommand::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(error) => {
                warn!(stream_id, command, "stream spawn failed: {error}");
                let _ = events.send(StreamEvent::Error {
                    stream_id: stream_id.to_string(),
                    error: error.to_string(),
                    timestamp: now_millis(),
                });
                self.state.hub.detach(stream_id, &events);
                return Ok(());
            }
        };

        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        active.insert(
            stream_id.to_string(),
            ActiveStream {
                generation,
                command: command.to_string(),
                started_at: Utc::now(),
                kill: kill.clone(),
                events: events.clone(),
            },
        );
        drop(active);

        info!(stream_id, command, pid = ?child.id(), "stream started");
        tokio::spawn(drive_stream(
            Arc::clone(&self.state),
            stream_id.to_string(),
            generation,
            child,
            events,
            kill,
        ));
        Ok(())
    }

    /// Signals the process and releases the entry without waiting for exit.
    /// Subscribers that are already attached still receive trailing output and
    /// the final `stream-end`.
    pub fn stop(&self, stream_id: &str) -> Result<(), ExecError> {
        let stream = self
            .state
            .active
            .lock()
            .remove(stream_id)
            .ok_or_else(|| ExecError::StreamNotFound(stream_id.to_string()))?;
        stream.kill.cancel();
        self.state.hub.detach(stream_id, &stream.events);
        info!(stream_id, command = %stream.command, "stream stop requested");
        Ok(())
    }
}

/// Receiver for one stream id. Dropping the last subscription of an id that
/// never started removes its channel.
#[derive(Debug)]
pub struct StreamSubscription {
    stream_id: String,
    receiver: Option<broadcast::Receiver<StreamEvent>>,
    state: Arc<StreamState>,
}

impl StreamSubscription {
    pub async fn recv(&mut self) -> Result<StreamEvent, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.state.prune(&self.stream_id);
    }
}

pub fn not_found_event(stream_id: &str) -> StreamEvent {
    StreamEvent::Error {
        stream_id: stream_id.to_string(),
        error: ExecError::StreamNotFound(stream_id.to_string()).to_string(),
        timestamp: now_millis(),
    }
}

impl StreamState {
    fn prune(&self, stream_id: &str) {
        let active = self.active.lock();
        if active.contains_key(stream_id) {
            return;
        }
        let mut channels = self.hub.channels.lock();
        if channels
            .get(stream_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(stream_id);
            debug!(stream_id, "dropped idle stream channel");
        }
    }

    fn release(&self, stream_id: &str, generation: u64) {
        let mut active = self.active.lock();
        if active
            .get(stream_id)
            .is_some_and(|stream| stream.generation == generation)
        {
            active.remove(stream_id);
        }
    }
}

async fn drive_stream(
    state: Arc<StreamState>,
    stream_id: String,
    generation: u64,
    mut child: Child,
    events: broadcast::Sender<StreamEvent>,
    kill: CancellationToken,
) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stdout_buf = vec![0u8; READ_CHUNK_BYTES];
    let mut stderr_buf = vec![0u8; READ_CHUNK_BYTES];
    let mut stdout_text = Utf8Carry::default();
    let mut stderr_text = Utf8Carry::default();
    let mut full_output = String::new();
    let mut kill_sent = false;

    let publish = |channel: StreamChannel, data: String, full_output: &mut String| {
        if data.is_empty() {
            return;
        }
        full_output.push_str(&data);
        let _ = events.send(StreamEvent::Data {
            stream_id: stream_id.clone(),
            channel,
            data,
            timestamp: now_millis(),
        });
    };

    let failure = loop {
        if stdout.is_none() && stderr.is_none() {
            break None;
        }
        tokio::select! {
            _ = kill.cancelled(), if !kill_sent => {
                kill_sent = true;
                debug!(stream_id, "killing stream process");
                if let Err(error) = child.start_kill() {
                    warn!(stream_id, "failed to kill stream process: {error}");
                }
            }
            read = read_chunk(&mut stdout, &mut stdout_buf), if stdout.is_some() => match read {
                Ok(0) => {
                    stdout = None;
                    publish(StreamChannel::Stdout, stdout_text.finish(), &mut full_output);
                }
                Ok(len) => publish(
                    StreamChannel::Stdout,
                    stdout_text.decode(&stdout_buf[..len]),
                    &mut full_output,
                ),
                Err(error) => break Some(error.to_string()),
            },
            read = read_chunk(&mut stderr, &mut stderr_buf), if stderr.is_some() => match read {
                Ok(0) => {
                    stderr = None;
                    publish(StreamChannel::Stderr, stderr_text.finish(), &mut full_output);
                }
                Ok(len) => publish(
                    StreamChannel::Stderr,
                    stderr_text.decode(&stderr_buf[..len]),
                    &mut full_output,
                ),
                Err(error) => break Some(error.to_string()),
            },
        }
    };

    let terminal = match failure {
        Some(error) => {
            let _ = child.start_kill();
            StreamEvent::Error {
                stream_id: stream_id.clone(),
                error,
                timestamp: now_millis(),
            }
        }
        None => match child.wait().await {
            Ok(status) => StreamEvent::End {
                stream_id: stream_id.clone(),
                exit_code: status.code(),
                full_output,
                timestamp: now_millis(),
            },
            Err(error) => StreamEvent::Error {
                stream_id: stream_id.clone(),
                error: error.to_string(),
                timestamp: now_millis(),
            },
        },
    };

    info!(stream_id, event = terminal.event_name(), "stream finished");
    let _ = events.send(terminal);
    state.release(&stream_id, generation);
    state.hub.detach(&stream_id, &events);
}

/// Decodes UTF-8 across read boundaries. An incomplete trailing sequence is
/// held back until the next chunk; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest = self.pending.as_slice();
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match error.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{StreamRunner, StreamSubscription, Utf8Carry};
    use crate::error::ExecError;
    use crate::model::{StreamChannel, StreamEvent};
    use crate::runner::AllowList;
    use tokio::time::{Duration, timeout};

    async fn collect_until_terminal(rx: &mut StreamSubscription) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("stream did not finish in time")
                .expect("stream channel closed early");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn publishes_chunks_then_end_with_full_output() {
        let runner = StreamRunner::new(AllowList::new("sh"), 64);
        let mut rx = runner.subscribe("s1");

        runner
            .start("sh -c 'printf first; sleep 0.3; printf second'", "s1")
            .unwrap();
        let events = collect_until_terminal(&mut rx).await;

        let chunks = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Data { channel, data, .. } => {
                    assert_eq!(*channel, StreamChannel::Stdout);
                    Some(data.clone())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(chunks, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(events.len(), 3);
        match events.last() {
            Some(StreamEvent::End {
                stream_id,
                exit_code,
                full_output,
                ..
            }) => {
                assert_eq!(stream_id, "s1");
                assert_eq!(*exit_code, Some(0));
                assert_eq!(full_output, "firstsecond");
            }
            other => panic!("expected stream-end, got {other:?}"),
        }
        assert!(!runner.is_active("s1"));
    }

    #[tokio::test]
    async fn stderr_chunks_are_tagged() {
        let runner = StreamRunner::new(AllowList::new("sh"), 64);
        let mut rx = runner.subscribe("warn");

        runner.start("sh -c 'printf oops >&2; exit 2'", "warn").unwrap();
        let events = collect_until_terminal(&mut rx).await;

        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::Data { channel: StreamChannel::Stderr, data, .. } if data == "oops"
        )));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::End { exit_code: Some(2), .. })
        ));
    }

    #[tokio::test]
    async fn unbalanced_quotes_are_rejected() {
        let runner = StreamRunner::new(AllowList::new("sh"), 64);
        assert!(matches!(
            runner.start("sh -c 'echo", "quotes"),
            Err(ExecError::InvalidCommand(_))
        ));
        assert!(!runner.is_active("quotes"));
    }

    #[tokio::test]
    async fn stop_on_unknown_stream_is_not_found() {
        let runner = StreamRunner::new(AllowList::new("sh"), 64);
        assert_eq!(
            runner.stop("s1"),
            Err(ExecError::StreamNotFound("s1".to_string()))
        );
    }

    #[tokio::test]
    async fn duplicate_active_id_is_a_conflict() {
        let runner = StreamRunner::new(AllowList::new("sleep"), 64);
        runner.start("sleep 5", "dup").unwrap();

        assert_eq!(
            runner.start("sleep 5", "dup"),
            Err(ExecError::StreamConflict("dup".to_string()))
        );
        runner.stop("dup").unwrap();
    }

    #[tokio::test]
    async fn stop_releases_entry_and_subscribers_see_end() {
        let runner = StreamRunner::new(AllowList::new("sleep"), 64);
        let mut rx = runner.subscribe("long");
        runner.start("sleep 30", "long").unwrap();
        assert!(runner.is_active("long"));

        runner.stop("long").unwrap();
        assert!(!runner.is_active("long"));

        let events = collect_until_terminal(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::End { exit_code: None, .. })
        ));
    }

    #[tokio::test]
    async fn id_is_reusable_after_stop() {
        let runner = StreamRunner::new(AllowList::new("sleep"), 64);
        runner.start("sleep 30", "again").unwrap();
        runner.stop("again").unwrap();

        runner.start("sleep 30", "again").unwrap();
        assert_eq!(runner.active_streams().len(), 1);
        runner.stop("again").unwrap();
    }

    #[tokio::test]
    async fn rejected_command_is_not_spawned() {
        let runner = StreamRunner::new(AllowList::new("kubectl"), 64);
        assert!(matches!(
            runner.start("sh -c 'echo nope'", "bad"),
            Err(ExecError::Validation { .. })
        ));
        assert!(runner.active_streams().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_published_as_error() {
        let runner = StreamRunner::new(AllowList::new("definitely-not-a-binary-kubecmds"), 64);
        let mut rx = runner.subscribe("missing");

        runner
            .start("definitely-not-a-binary-kubecmds logs -f", "missing")
            .unwrap();
        let events = collect_until_terminal(&mut rx).await;

        assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
        assert!(!runner.is_active("missing"));
    }

    #[test]
    fn split_multibyte_character_is_held_back() {
        let mut carry = Utf8Carry::default();
        let bytes = "aé".as_bytes();

        assert_eq!(carry.decode(&bytes[..2]), "a");
        assert_eq!(carry.decode(&bytes[2..]), "é");
        assert_eq!(carry.decode(b"ok\xffok"), "ok\u{FFFD}ok");
        assert_eq!(carry.decode(&bytes[1..2]), "");
        assert_eq!(carry.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn character_across_read_boundary_survives() {
        let runner = StreamRunner::new(AllowList::new("sh"), 64);
        let mut rx = runner.subscribe("utf8");

        runner
            .start(
                r#"sh -c 'x=$(head -c 8191 /dev/zero | tr "\000" a); printf "%s\303\251" "$x"'"#,
                "utf8",
            )
            .unwrap();
        let events = collect_until_terminal(&mut rx).await;

        let streamed = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Data { data, .. } => Some(data.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert!(!streamed.contains(char::REPLACEMENT_CHARACTER));
        match events.last() {
            Some(StreamEvent::End { full_output, .. }) => {
                assert_eq!(full_output.chars().count(), 8192);
                assert!(full_output.ends_with('é'));
                assert_eq!(full_output, &streamed);
            }
            other => panic!("expected stream-end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_subscription_leaves_no_channel_behind() {
        let runner = StreamRunner::new(AllowList::new("sh"), 64);

        let first = runner.subscribe("ghost");
        let second = runner.subscribe("ghost");
        drop(first);
        assert!(runner.state.hub.channels.lock().contains_key("ghost"));
        drop(second);
        assert!(runner.state.hub.channels.lock().is_empty());

        let mut rx = runner.subscribe("done");
        runner.start("sh -c 'printf hi'", "done").unwrap();
        collect_until_terminal(&mut rx).await;
        drop(rx);
        for _ in 0..100 {
            if !runner.is_active("done") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let late = runner.subscribe("done");
        drop(late);
        assert!(runner.state.hub.channels.lock().is_empty());
    }
}
