//! In-process datastore server with key/value and publish/subscribe support.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use apm_primitives::Product;
use apm_telemetry::CallContext;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::pubsub::{MessageKind, PubSubMessage};
use crate::transport::{ServerAddress, SubscriberConnection, Transport};
use crate::{Command, DatastoreError, DatastoreResult, Reply};

#[derive(Debug, Default)]
struct ClientInfo {
    name: Option<String>,
    lib_name: Option<String>,
    lib_ver: Option<String>,
}

#[derive(Debug)]
struct Subscriber {
    channels: Vec<String>,
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

impl Subscriber {
    fn subscription_count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    kv: HashMap<Bytes, Bytes>,
    clients: BTreeMap<u64, ClientInfo>,
    subscribers: BTreeMap<u64, Subscriber>,
}

#[derive(Debug)]
struct ServerInner {
    address: ServerAddress,
    product: Product,
    next_id: AtomicU64,
    state: Mutex<ServerState>,
}

impl ServerInner {
    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state().clients.insert(id, ClientInfo::default());
        id
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state();
        state.clients.remove(&id);
        state.subscribers.remove(&id);
    }
}

/// In-process datastore reachable through [`MemoryTransport`] connections.
#[derive(Clone, Debug)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    /// Creates a server that reports itself at `address` as `product`.
    #[must_use]
    pub fn new(address: ServerAddress, product: Product) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                address,
                product,
                next_id: AtomicU64::new(0),
                state: Mutex::new(ServerState::default()),
            }),
        }
    }

    /// Opens a new connection.
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        let id = self.inner.register();
        debug!(client_id = id, address = %self.inner.address, "memory connection opened");
        MemoryTransport {
            server: Arc::clone(&self.inner),
            id,
        }
    }

    /// Number of open connections, subscribers included.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.state().clients.len()
    }
}

/// Connection to a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryTransport {
    server: Arc<ServerInner>,
    id: u64,
}

impl MemoryTransport {
    /// Server-assigned client id.
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.server.unregister(self.id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn address(&self) -> &ServerAddress {
        &self.server.address
    }

    fn product(&self) -> &Product {
        &self.server.product
    }

    async fn send(&self, _ctx: &CallContext, command: Command) -> DatastoreResult<Reply> {
        let mut state = self.server.state();
        execute(&mut state, self.id, &command)
    }

    async fn send_batch(
        &self,
        _ctx: &CallContext,
        commands: Vec<Command>,
        atomic: bool,
    ) -> DatastoreResult<Vec<Reply>> {
        // One lock for the whole batch makes it atomic against other clients.
        let mut state = self.server.state();
        let replies = commands
            .iter()
            .map(|command| execute(&mut state, self.id, command))
            .collect::<DatastoreResult<Vec<_>>>()?;
        trace!(client_id = self.id, count = replies.len(), atomic, "batch executed");
        Ok(replies)
    }

    async fn open_subscriber(&self) -> DatastoreResult<Box<dyn SubscriberConnection>> {
        let id = self.server.register();
        let (tx, rx) = mpsc::unbounded_channel();
        self.server.state().subscribers.insert(
            id,
            Subscriber {
                channels: Vec::new(),
                patterns: Vec::new(),
                tx,
            },
        );
        debug!(client_id = id, "memory subscriber opened");
        Ok(Box::new(MemorySubscriber {
            server: Arc::clone(&self.server),
            id,
            rx,
            closed: false,
        }))
    }
}

struct MemorySubscriber {
    server: Arc<ServerInner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    closed: bool,
}

impl MemorySubscriber {
    fn add(&mut self, names: &[String], kind: MessageKind) -> DatastoreResult<()> {
        if self.closed {
            return Err(DatastoreError::Closed);
        }
        let mut state = self.server.state();
        let subscriber = state
            .subscribers
            .get_mut(&self.id)
            .ok_or(DatastoreError::Closed)?;
        for name in names {
            let list = match kind {
                MessageKind::PSubscribe => &mut subscriber.patterns,
                _ => &mut subscriber.channels,
            };
            if !list.contains(name) {
                list.push(name.clone());
            }
            let count = subscriber.subscription_count();
            // The receiver lives in `self`, so the send cannot fail here.
            let _ = subscriber.tx.send(PubSubMessage {
                kind,
                channel: name.clone(),
                pattern: None,
                data: Bytes::from(count.to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberConnection for MemorySubscriber {
    async fn subscribe(&mut self, channels: &[String]) -> DatastoreResult<()> {
        self.add(channels, MessageKind::Subscribe)
    }

    async fn psubscribe(&mut self, patterns: &[String]) -> DatastoreResult<()> {
        self.add(patterns, MessageKind::PSubscribe)
    }

    async fn next_message(&mut self) -> Option<PubSubMessage> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.unregister(self.id);
            self.rx.close();
        }
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        if !self.closed {
            self.server.unregister(self.id);
        }
    }
}

fn execute(state: &mut ServerState, client_id: u64, command: &Command) -> DatastoreResult<Reply> {
    let args = command.args();
    let arity = |min: usize| {
        if args.len() < min {
            Err(DatastoreError::server(format!(
                "ERR wrong number of arguments for '{}' command",
                command.verb().to_ascii_lowercase()
            )))
        } else {
            Ok(())
        }
    };

    match command.verb() {
        "PING" => Ok(Reply::Status("PONG".into())),
        "MULTI" | "EXEC" => Ok(Reply::Status("OK".into())),
        "GET" => {
            arity(1)?;
            Ok(state
                .kv
                .get(&args[0])
                .map_or(Reply::Nil, |v| Reply::Bulk(v.clone())))
        }
        "SET" => {
            arity(2)?;
            state.kv.insert(args[0].clone(), args[1].clone());
            Ok(Reply::Status("OK".into()))
        }
        "DEL" => {
            arity(1)?;
            let removed = args.iter().filter(|k| state.kv.remove(*k).is_some()).count();
            Ok(Reply::Integer(to_i64(removed)))
        }
        "EXISTS" => {
            arity(1)?;
            let present = args.iter().filter(|k| state.kv.contains_key(*k)).count();
            Ok(Reply::Integer(to_i64(present)))
        }
        "PUBLISH" => {
            arity(2)?;
            let channel = String::from_utf8_lossy(&args[0]).into_owned();
            Ok(Reply::Integer(to_i64(publish(state, &channel, &args[1]))))
        }
        "CLIENT" => client_command(state, client_id, command),
        other => Err(DatastoreError::server(format!(
            "ERR unknown command '{}'",
            other.to_ascii_lowercase()
        ))),
    }
}

fn client_command(
    state: &mut ServerState,
    client_id: u64,
    command: &Command,
) -> DatastoreResult<Reply> {
    let sub = command.subcommand().unwrap_or_default();
    match sub.as_str() {
        "ID" => Ok(Reply::Integer(i64::try_from(client_id).unwrap_or(i64::MAX))),
        "LIST" => {
            let mut out = String::new();
            for (id, info) in &state.clients {
                let _ = writeln!(
                    out,
                    "id={id} name={} lib-name={} lib-ver={}",
                    info.name.as_deref().unwrap_or(""),
                    info.lib_name.as_deref().unwrap_or(""),
                    info.lib_ver.as_deref().unwrap_or(""),
                );
            }
            Ok(Reply::Bulk(Bytes::from(out)))
        }
        "SETNAME" => {
            let name = command
                .arg_str(1)
                .ok_or_else(|| DatastoreError::server("ERR missing client name"))?
                .into_owned();
            state.clients.entry(client_id).or_default().name = Some(name);
            Ok(Reply::Status("OK".into()))
        }
        "SETINFO" => {
            let (Some(attr), Some(value)) = (command.arg_str(1), command.arg_str(2)) else {
                return Err(DatastoreError::server(
                    "ERR wrong number of arguments for 'client|setinfo' command",
                ));
            };
            let info = state.clients.entry(client_id).or_default();
            match attr.to_ascii_uppercase().as_str() {
                "LIB-NAME" => info.lib_name = Some(value.into_owned()),
                "LIB-VER" => info.lib_ver = Some(value.into_owned()),
                other => {
                    return Err(DatastoreError::server(format!(
                        "ERR unrecognized option '{other}'"
                    )));
                }
            }
            Ok(Reply::Status("OK".into()))
        }
        other => Err(DatastoreError::server(format!(
            "ERR unknown subcommand '{}'",
            other.to_ascii_lowercase()
        ))),
    }
}

fn publish(state: &ServerState, channel: &str, payload: &Bytes) -> usize {
    let mut delivered = 0;
    for subscriber in state.subscribers.values() {
        if subscriber.channels.iter().any(|c| c == channel) {
            let sent = subscriber.tx.send(PubSubMessage {
                kind: MessageKind::Message,
                channel: channel.to_owned(),
                pattern: None,
                data: payload.clone(),
            });
            delivered += usize::from(sent.is_ok());
        }
        for pattern in subscriber.patterns.iter().filter(|p| glob_match(p, channel)) {
            let sent = subscriber.tx.send(PubSubMessage {
                kind: MessageKind::PMessage,
                channel: channel.to_owned(),
                pattern: Some(pattern.clone()),
                data: payload.clone(),
            });
            delivered += usize::from(sent.is_ok());
        }
    }
    trace!(channel, delivered, "published");
    delivered
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Glob matching with `*`, `?`, and `\` escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                p += 2;
                t += 1;
                continue;
            }
            Some('[') => match match_class(&pattern, p, text[t]) {
                Some((true, next)) => {
                    p = next;
                    t += 1;
                    continue;
                }
                None if text[t] == '[' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            },
            Some(c) if *c != '\\' && *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                backtrack = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Matches `c` against the `[...]` class opening at `pattern[open]`.
///
/// Returns whether it matched and the index after the closing `]`, or `None`
/// when the class is unterminated and `[` is literal.
fn match_class(pattern: &[char], open: usize, c: char) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negated = pattern.get(i) == Some(&'^');
    if negated {
        i += 1;
    }
    let mut matched = false;
    loop {
        match *pattern.get(i)? {
            ']' => break,
            '\\' => {
                i += 1;
                matched |= *pattern.get(i)? == c;
                i += 1;
            }
            lo if is_range(pattern, i) => {
                let hi = pattern[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                matched |= (lo..=hi).contains(&c);
                i += 3;
            }
            other => {
                matched |= other == c;
                i += 1;
            }
        }
    }
    Some((matched != negated, i + 1))
}

fn is_range(pattern: &[char], i: usize) -> bool {
    pattern.get(i + 1) == Some(&'-') && pattern.get(i + 2).is_some_and(|hi| *hi != ']')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> MemoryServer {
        MemoryServer::new(
            ServerAddress::new("localhost", 6379),
            Product::new("Valkey").unwrap(),
        )
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("channel:*", "channel:abc"));
        assert!(glob_match("ch?nnel", "channel"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("lit\\*", "lit*"));
        assert!(!glob_match("lit\\*", "litX"));
    }

    #[test]
    fn glob_character_classes() {
        assert!(glob_match("channel:[12]", "channel:1"));
        assert!(glob_match("channel:[12]", "channel:2"));
        assert!(!glob_match("channel:[12]", "channel:3"));
        assert!(glob_match("shard-[a-c]*", "shard-b7"));
        assert!(!glob_match("shard-[a-c]*", "shard-d7"));
        assert!(glob_match("[^x]y", "zy"));
        assert!(!glob_match("[^x]y", "xy"));
        assert!(glob_match("[\\]]", "]"));
        assert!(glob_match("*[0-9]", "events:9"));
        assert!(glob_match("open[", "open["));
    }

    #[tokio::test]
    async fn set_get_round_trip() {
        let conn = server().connect();
        let ctx = CallContext::root();
        conn.send(&ctx, Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap();
        let reply = conn.send(&ctx, Command::new("GET").arg("k")).await.unwrap();
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"v")));
        let missing = conn.send(&ctx, Command::new("GET").arg("nope")).await.unwrap();
        assert_eq!(missing, Reply::Nil);
    }

    #[tokio::test]
    async fn unknown_commands_error() {
        let conn = server().connect();
        let err = conn
            .send(&CallContext::root(), Command::new("FLY"))
            .await
            .expect_err("unknown command");
        assert!(matches!(err, DatastoreError::Server { .. }));
    }

    #[tokio::test]
    async fn pattern_subscribers_receive_in_order() {
        let server = server();
        let conn = server.connect();
        let mut sub = conn.open_subscriber().await.unwrap();
        sub.psubscribe(&["news:*".to_owned()]).await.unwrap();

        let confirm = sub.next_message().await.unwrap();
        assert_eq!(confirm.kind, MessageKind::PSubscribe);

        let ctx = CallContext::root();
        for body in ["one", "two"] {
            let reply = conn
                .send(&ctx, Command::new("PUBLISH").arg("news:today").arg(body))
                .await
                .unwrap();
            assert_eq!(reply, Reply::Integer(1));
        }
        assert_eq!(sub.next_message().await.unwrap().data, Bytes::from_static(b"one"));
        let second = sub.next_message().await.unwrap();
        assert_eq!(second.kind, MessageKind::PMessage);
        assert_eq!(second.pattern.as_deref(), Some("news:*"));
        assert_eq!(second.data, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn client_list_reports_setinfo() {
        let server = server();
        let conn = server.connect();
        let ctx = CallContext::root();
        conn.send(
            &ctx,
            Command::from_parts(&["CLIENT", "SETINFO", "LIB-NAME", "apm"]).unwrap(),
        )
        .await
        .unwrap();
        let list = conn
            .send(&ctx, Command::from_parts(&["CLIENT", "LIST"]).unwrap())
            .await
            .unwrap()
            .into_optional_bytes("CLIENT")
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&list).contains("lib-name=apm"));
        assert_eq!(server.connection_count(), 1);
        drop(conn);
        assert_eq!(server.connection_count(), 0);
    }
}
