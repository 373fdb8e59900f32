//! [`RealtimeTransport`] over the Supabase realtime websocket.
//!
//! A single socket task owns the connection. Subscribers talk to it
//! through a command channel; topic state (filters, presence, outbound
//! senders) is shared so the synchronous trait methods never wait on the
//! socket. When the socket drops, every topic is told `ChannelError`, the
//! task reconnects with backoff and rejoins whatever is still registered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use interpretix_realtime::transport::{
    PresenceState, RealtimeTransport, TransportChannel, TransportMessage,
};
use interpretix_realtime::{RealtimeError, TableFilter};
use interpretix_types::events::SubscriptionStatus;

use crate::config::SupabaseConfig;
use crate::protocol::{self, Frame, ReplyStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub heartbeat_interval: Duration,
    /// Reconnect delays by attempt; the last one repeats.
    pub backoff: Vec<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            backoff: [1, 2, 5, 10].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

impl SocketOptions {
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        self.backoff
            .get(attempt)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }
}

struct TopicState {
    filter: TableFilter,
    tx: mpsc::UnboundedSender<TransportMessage>,
    presence: PresenceState,
    tracked: Option<Value>,
    /// Ref of the most recent join sent for this topic.
    join_ref: Option<String>,
}

#[derive(Default)]
struct SocketState {
    topics: HashMap<String, TopicState>,
    /// Join ref -> topic key, for matching `phx_reply`.
    pending_joins: HashMap<String, String>,
    next_ref: u64,
    connected: bool,
}

impl SocketState {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn send_to(&self, key: &str, message: TransportMessage) {
        if let Some(topic) = self.topics.get(key) {
            let _ = topic.tx.send(message);
        }
    }

    /// Frames without a join ref can't be attributed and count as current.
    fn is_current_join(&self, key: &str, join_ref: Option<&str>) -> bool {
        match join_ref {
            None => true,
            Some(r) => self.topics.get(key).and_then(|t| t.join_ref.as_deref()) == Some(r),
        }
    }

    fn broadcast(&self, message: TransportMessage) {
        for topic in self.topics.values() {
            let _ = topic.tx.send(message.clone());
        }
    }
}

enum Command {
    Join(String),
    Leave(String),
    Track(String),
    Untrack(String),
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

pub struct SupabaseRealtime {
    state: Arc<Mutex<SocketState>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SupabaseRealtime {
    /// Starts the socket task. Connection happens in the background.
    pub fn spawn(config: SupabaseConfig, options: SocketOptions) -> Self {
        let state = Arc::new(Mutex::new(SocketState::default()));
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(config, options, state.clone(), rx));
        Self {
            state,
            commands,
            task,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn command(&self, command: Command) -> Result<(), RealtimeError> {
        self.commands
            .send(command)
            .map_err(|_| RealtimeError::TransportClosed)
    }
}

impl Drop for SupabaseRealtime {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RealtimeTransport for SupabaseRealtime {
    fn subscribe(&self, topic: &str, filter: &TableFilter) -> Result<TransportChannel, RealtimeError> {
        if self.task.is_finished() {
            return Err(RealtimeError::TransportClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportMessage::Status(SubscriptionStatus::Joining));
        self.state.lock().topics.insert(
            topic.to_string(),
            TopicState {
                filter: filter.clone(),
                tx,
                presence: PresenceState::new(),
                tracked: None,
                join_ref: None,
            },
        );
        if let Err(e) = self.command(Command::Join(topic.to_string())) {
            self.state.lock().topics.remove(topic);
            return Err(e);
        }
        Ok(TransportChannel {
            topic: topic.to_string(),
            messages: rx,
        })
    }

    fn unsubscribe(&self, topic: &str) {
        if self.state.lock().topics.remove(topic).is_some() {
            let _ = self.command(Command::Leave(topic.to_string()));
        }
    }

    fn track(&self, topic: &str, payload: Value) -> Result<(), RealtimeError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| RealtimeError::UnknownChannel(topic.to_string()))?;
            entry.tracked = Some(payload);
        }
        self.command(Command::Track(topic.to_string()))
    }

    fn untrack(&self, topic: &str) {
        let had = self
            .state
            .lock()
            .topics
            .get_mut(topic)
            .and_then(|t| t.tracked.take())
            .is_some();
        if had {
            let _ = self.command(Command::Untrack(topic.to_string()));
        }
    }

    fn presence_state(&self, topic: &str) -> PresenceState {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.presence.clone())
            .unwrap_or_default()
    }
}

async fn run_socket(
    config: SupabaseConfig,
    options: SocketOptions,
    state: Arc<Mutex<SocketState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let url = config.realtime_url();
    let mut attempt = 0usize;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Realtime socket connected to {}", config.url);
                attempt = 0;
                state.lock().connected = true;

                let end = session(ws, &config, &options, &state, &mut commands).await;

                {
                    let mut s = state.lock();
                    s.connected = false;
                    s.pending_joins.clear();
                    s.broadcast(TransportMessage::Status(SubscriptionStatus::ChannelError));
                }
                if end == SessionEnd::Shutdown {
                    info!("Realtime socket shut down");
                    return;
                }
            }
            Err(e) => warn!("Realtime socket connect failed: {}", e),
        }

        let delay = options.backoff_delay(attempt);
        attempt += 1;
        info!("Reconnecting realtime socket in {}ms", delay.as_millis());

        // Registered topics are rejoined on connect, so commands that
        // arrive while offline only need draining.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => {
                    if command.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

async fn session(
    ws: WsStream,
    config: &SupabaseConfig,
    options: &SocketOptions,
    state: &Mutex<SocketState>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut joined: HashSet<String> = HashSet::new();

    let keys: Vec<String> = state.lock().topics.keys().cloned().collect();
    for key in keys {
        let Some(frame) = join_frame(state, config, &key) else {
            continue;
        };
        if let Err(e) = send_frame(&mut sink, &frame).await {
            warn!("Rejoin of {} failed: {}", key, e);
            return SessionEnd::Lost;
        }
        joined.insert(key);
    }

    let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut awaiting_heartbeat: Option<String> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let outbound = match incoming {
                    Some(Ok(WsMessage::Text(text))) => match Frame::decode(&text) {
                        Ok(frame) => handle_frame(frame, state, &mut awaiting_heartbeat),
                        Err(e) => {
                            warn!("Undecodable realtime frame: {}", e);
                            Vec::new()
                        }
                    },
                    Some(Ok(WsMessage::Close(reason))) => {
                        info!("Realtime socket closed by server: {:?}", reason);
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => {
                        warn!("Realtime socket error: {}", e);
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                };
                for frame in outbound {
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        warn!("Realtime send failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                };
                let Some(frame) = command_frame(command, state, config, &mut joined) else {
                    continue;
                };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    warn!("Realtime send failed: {}", e);
                    return SessionEnd::Lost;
                }
            }
            _ = heartbeat.tick() => {
                if let Some(reference) = awaiting_heartbeat.take() {
                    warn!("Heartbeat {} was not acknowledged", reference);
                    return SessionEnd::Lost;
                }
                let reference = state.lock().next_ref();
                if let Err(e) = send_frame(&mut sink, &protocol::heartbeat(reference.clone())).await {
                    warn!("Heartbeat send failed: {}", e);
                    return SessionEnd::Lost;
                }
                awaiting_heartbeat = Some(reference);
            }
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), tungstenite::Error> {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode {} frame: {}", frame.event, e);
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text.into())).await
}

fn join_frame(state: &Mutex<SocketState>, config: &SupabaseConfig, key: &str) -> Option<Frame> {
    let mut s = state.lock();
    let filter = s.topics.get(key)?.filter.clone();
    let reference = s.next_ref();
    s.pending_joins.insert(reference.clone(), key.to_string());
    if let Some(topic) = s.topics.get_mut(key) {
        topic.join_ref = Some(reference.clone());
    }
    Some(protocol::join(key, &filter, config.bearer(), reference))
}

fn command_frame(
    command: Command,
    state: &Mutex<SocketState>,
    config: &SupabaseConfig,
    joined: &mut HashSet<String>,
) -> Option<Frame> {
    match command {
        Command::Join(key) => {
            if joined.contains(&key) {
                return None;
            }
            let frame = join_frame(state, config, &key)?;
            joined.insert(key);
            Some(frame)
        }
        Command::Leave(key) => {
            if !joined.remove(&key) {
                return None;
            }
            let reference = state.lock().next_ref();
            Some(protocol::leave(&key, reference))
        }
        Command::Track(key) => {
            if !joined.contains(&key) {
                return None;
            }
            let mut s = state.lock();
            let meta = s.topics.get(&key)?.tracked.clone()?;
            let reference = s.next_ref();
            Some(protocol::track(&key, &meta, reference))
        }
        Command::Untrack(key) => {
            if !joined.contains(&key) {
                return None;
            }
            let reference = state.lock().next_ref();
            Some(protocol::untrack(&key, reference))
        }
    }
}

/// Routes one inbound frame. Returns frames to send in response.
fn handle_frame(
    frame: Frame,
    state: &Mutex<SocketState>,
    awaiting_heartbeat: &mut Option<String>,
) -> Vec<Frame> {
    let mut outbound = Vec::new();

    if frame.topic == protocol::PHOENIX_TOPIC {
        if frame.event == protocol::PHX_REPLY && frame.reference.is_some() && frame.reference == *awaiting_heartbeat {
            *awaiting_heartbeat = None;
            state.lock().broadcast(TransportMessage::Heartbeat);
        }
        return outbound;
    }

    let Some(key) = frame.channel_key() else {
        debug!("Ignoring frame for topic {}", frame.topic);
        return outbound;
    };

    let mut s = state.lock();
    match frame.event.as_str() {
        protocol::PHX_REPLY => {
            let join = frame
                .reference
                .as_ref()
                .and_then(|r| s.pending_joins.remove(r));
            if join.as_deref() != Some(key) {
                s.send_to(key, TransportMessage::Heartbeat);
                return outbound;
            }
            match protocol::reply_status(&frame.payload) {
                ReplyStatus::Ok => {
                    info!("Joined realtime topic {}", key);
                    s.send_to(key, TransportMessage::Status(SubscriptionStatus::Subscribed));
                    if let Some(meta) = s.topics.get(key).and_then(|t| t.tracked.clone()) {
                        let reference = s.next_ref();
                        outbound.push(protocol::track(key, &meta, reference));
                    }
                }
                ReplyStatus::Error(reason) => {
                    warn!("Join of {} rejected: {}", key, reason);
                    s.send_to(key, TransportMessage::Status(SubscriptionStatus::ChannelError));
                }
            }
        }
        protocol::POSTGRES_CHANGES => match protocol::decode_change(&frame.payload) {
            Ok(change) => s.send_to(key, TransportMessage::Change(change)),
            Err(e) => warn!("Bad postgres_changes payload on {}: {}", key, e),
        },
        protocol::PHX_CLOSE | protocol::PHX_ERROR
            if !s.is_current_join(key, frame.join_ref.as_deref()) =>
        {
            debug!("Ignoring {} from an earlier join of {}", frame.event, key);
        }
        protocol::PHX_CLOSE => s.send_to(key, TransportMessage::Status(SubscriptionStatus::Closed)),
        protocol::PHX_ERROR => {
            s.send_to(key, TransportMessage::Status(SubscriptionStatus::ChannelError))
        }
        protocol::PRESENCE_STATE => {
            if let Some(topic) = s.topics.get_mut(key) {
                protocol::apply_presence_state(&mut topic.presence, &frame.payload);
            }
        }
        protocol::PRESENCE_DIFF => {
            if let Some(topic) = s.topics.get_mut(key) {
                protocol::apply_presence_diff(&mut topic.presence, &frame.payload);
            }
        }
        protocol::SYSTEM => debug!("System message on {}: {}", key, frame.payload),
        other => debug!("Unhandled {} frame on {}", other, key),
    }
    outbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpretix_types::events::ChangeKind;
    use serde_json::json;

    fn state_with(key: &str) -> (Mutex<SocketState>, mpsc::UnboundedReceiver<TransportMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = SocketState::default();
        state.topics.insert(
            key.to_string(),
            TopicState {
                filter: TableFilter::new("messages", ChangeKind::All),
                tx,
                presence: PresenceState::new(),
                tracked: None,
                join_ref: None,
            },
        );
        (Mutex::new(state), rx)
    }

    fn frame(topic: &str, event: &str, reference: Option<&str>, payload: Value) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: reference.map(str::to_string),
            join_ref: None,
        }
    }

    fn config() -> SupabaseConfig {
        SupabaseConfig::new("https://proj.supabase.co", "anon")
    }

    #[test]
    fn test_backoff_schedule() {
        let options = SocketOptions::default();
        let delays: Vec<u64> = (0..6).map(|a| options.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 5, 10, 10, 10]);
    }

    #[test]
    fn test_join_reply_marks_subscribed_and_retracks() {
        let (state, mut rx) = state_with("messages-all-all");
        state.lock().topics.get_mut("messages-all-all").unwrap().tracked = Some(json!({ "status": "busy" }));
        let join = join_frame(&state, &config(), "messages-all-all").unwrap();
        let mut awaiting = None;

        let reply = frame(
            "realtime:messages-all-all",
            protocol::PHX_REPLY,
            join.reference.as_deref(),
            json!({ "status": "ok", "response": {} }),
        );
        let outbound = handle_frame(reply, &state, &mut awaiting);

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportMessage::Status(SubscriptionStatus::Subscribed)
        );
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].event, protocol::PRESENCE);
        assert!(state.lock().pending_joins.is_empty());
    }

    #[test]
    fn test_rejected_join_is_channel_error() {
        let (state, mut rx) = state_with("k");
        let join = join_frame(&state, &config(), "k").unwrap();
        let reply = frame(
            "realtime:k",
            protocol::PHX_REPLY,
            join.reference.as_deref(),
            json!({ "status": "error", "response": { "reason": "bad filter" } }),
        );
        handle_frame(reply, &state, &mut None);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportMessage::Status(SubscriptionStatus::ChannelError)
        );
    }

    #[test]
    fn test_change_routed_to_topic() {
        let (state, mut rx) = state_with("k");
        let payload = json!({
            "data": {
                "type": "UPDATE",
                "schema": "public",
                "table": "messages",
                "record": { "id": "6f1c5c2e-7d55-4a8e-9f7e-0a4a3f0d8c11" }
            }
        });
        handle_frame(frame("realtime:k", protocol::POSTGRES_CHANGES, None, payload), &state, &mut None);
        match rx.try_recv().unwrap() {
            TransportMessage::Change(change) => assert_eq!(change.event_type, ChangeKind::Update),
            other => panic!("unexpected {:?}", other),
        }

        handle_frame(frame("realtime:other", protocol::POSTGRES_CHANGES, None, json!({})), &state, &mut None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_heartbeat_ack_fans_out() {
        let (state, mut rx) = state_with("k");
        let mut awaiting = Some("7".to_string());

        handle_frame(frame("phoenix", protocol::PHX_REPLY, Some("6"), json!({})), &state, &mut awaiting);
        assert!(awaiting.is_some());
        assert!(rx.try_recv().is_err());

        handle_frame(frame("phoenix", protocol::PHX_REPLY, Some("7"), json!({ "status": "ok" })), &state, &mut awaiting);
        assert!(awaiting.is_none());
        assert_eq!(rx.try_recv().unwrap(), TransportMessage::Heartbeat);
    }

    #[test]
    fn test_close_and_error_statuses() {
        let (state, mut rx) = state_with("k");
        handle_frame(frame("realtime:k", protocol::PHX_ERROR, None, json!({})), &state, &mut None);
        handle_frame(frame("realtime:k", protocol::PHX_CLOSE, None, json!({})), &state, &mut None);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportMessage::Status(SubscriptionStatus::ChannelError)
        );
        assert_eq!(rx.try_recv().unwrap(), TransportMessage::Status(SubscriptionStatus::Closed));
    }

    #[test]
    fn test_close_from_earlier_join_is_ignored() {
        let (state, mut rx) = state_with("k");
        let first = join_frame(&state, &config(), "k").unwrap();
        let second = join_frame(&state, &config(), "k").unwrap();

        let mut stale = frame("realtime:k", protocol::PHX_CLOSE, None, json!({}));
        stale.join_ref = first.join_ref.clone();
        handle_frame(stale, &state, &mut None);
        assert!(rx.try_recv().is_err());

        let mut current = frame("realtime:k", protocol::PHX_ERROR, None, json!({}));
        current.join_ref = second.join_ref.clone();
        handle_frame(current, &state, &mut None);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportMessage::Status(SubscriptionStatus::ChannelError)
        );
    }

    #[test]
    fn test_presence_frames_update_state() {
        let (state, _rx) = state_with("k");
        handle_frame(
            frame(
                "realtime:k",
                protocol::PRESENCE_STATE,
                None,
                json!({ "u1": { "metas": [{ "phx_ref": "a" }] } }),
            ),
            &state,
            &mut None,
        );
        assert_eq!(state.lock().topics["k"].presence["u1"].len(), 1);
    }

    #[test]
    fn test_commands_respect_joined_set() {
        let (state, _rx) = state_with("k");
        let mut joined = HashSet::new();

        assert!(command_frame(Command::Leave("k".into()), &state, &config(), &mut joined).is_none());
        let join = command_frame(Command::Join("k".into()), &state, &config(), &mut joined).unwrap();
        assert_eq!(join.event, protocol::PHX_JOIN);
        assert!(command_frame(Command::Join("k".into()), &state, &config(), &mut joined).is_none());
        assert!(command_frame(Command::Track("k".into()), &state, &config(), &mut joined).is_none());
        let leave = command_frame(Command::Leave("k".into()), &state, &config(), &mut joined).unwrap();
        assert_eq!(leave.event, protocol::PHX_LEAVE);
    }
}
