//! End-to-end tests: a real server on an ephemeral port, driven over TCP
//! through the JSON protocol (plus a legacy-mode smoke test).

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tempfile::TempDir;

use rsvpd::Registry;
use rsvpd::config::Config;
use rsvpd::core::Host;
use rsvpd::daemon::{LogNotifier, Prober, Response, Server, state};

// =============================================================================
// Fixture
// =============================================================================

struct SilentProber;

impl Prober for SilentProber {
    fn resolve(&self, _name: &str) -> bool {
        true
    }

    fn probe(&self, _names: &[String]) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

struct DaemonFixture {
    dir: TempDir,
    server: Server,
}

impl DaemonFixture {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("create state dir");
        let mut config = Config {
            port: 0,
            state_file: dir.path().join("hosts.state"),
            ..Config::default()
        };
        tweak(&mut config);
        let server = Server::start(config, Box::new(LogNotifier), Box::new(SilentProber))
            .expect("start server");
        Self { dir, server }
    }

    fn client(&self) -> Client {
        Client::connect(&self.server)
    }

    fn state_path(&self) -> std::path::PathBuf {
        self.dir.path().join("hosts.state")
    }

    fn add_farm_hosts(&self, names: &[&str]) {
        let mut client = self.client();
        for name in names {
            let resp = client.request("add_host", json!({"host": name, "classes": ["FARM"]}));
            assert!(resp.is_success(), "add_host {name}: {}", resp.message);
        }
    }
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(server: &Server) -> Self {
        let addr = ("127.0.0.1", server.local_addr().port());
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// One JSON-mode round trip.
    fn request(&mut self, cmd: &str, params: Value) -> Response {
        let body = json!({"cmd": cmd, "params": params}).to_string();
        let frame = format!("json {}\n{}", body.len(), body);
        self.stream.write_all(frame.as_bytes()).expect("send");

        let (header, payload) = self.read_frame();
        let (echoed, len) = header.split_once(' ').expect("header shape");
        assert_eq!(echoed, cmd, "response echoes the command");
        assert_eq!(len.parse::<usize>().expect("length"), payload.len());
        serde_json::from_slice(&payload).expect("response json")
    }

    /// Read `<token> <len>\n<len bytes>`.
    fn read_frame(&mut self) -> (String, Vec<u8>) {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let header = String::from_utf8_lossy(&self.buf[..pos]).to_string();
                let len: usize = header
                    .rsplit(' ')
                    .next()
                    .and_then(|l| l.parse().ok())
                    .unwrap_or_else(|| panic!("bad header {header:?}"));
                if self.buf.len() >= pos + 1 + len {
                    let payload = self.buf[pos + 1..pos + 1 + len].to_vec();
                    self.buf.drain(..pos + 1 + len);
                    return (header, payload);
                }
            }
            self.fill();
        }
    }

    fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).expect("recv");
        assert!(n > 0, "server closed the connection");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    /// One legacy-mode round trip; returns the decoded response text.
    fn request_dumper(&mut self, cmd: &str, body: &str) -> String {
        let frame = format!("{cmd} {}\n", hex::encode(body));
        self.stream.write_all(frame.as_bytes()).expect("send");

        // Response is `<cmd> <hex>\nDONE\n`.
        while !self.buf.windows(5).any(|w| w == b"DONE\n") {
            self.fill();
        }
        let text = String::from_utf8_lossy(&self.buf).to_string();
        self.buf.clear();
        let line = text.lines().next().expect("response line");
        let (echoed, hex_body) = line.split_once(' ').expect("line shape");
        assert_eq!(echoed, cmd);
        String::from_utf8(hex::decode(hex_body).expect("hex body")).expect("utf8 body")
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn s1_add_class_and_list() {
    let fixture = DaemonFixture::new();
    let mut client = fixture.client();

    let resp = client.request(
        "add_class",
        json!({"class": "web", "members": [], "description": "web tier"}),
    );
    assert!(resp.is_success());
    assert_eq!(resp.message, "added class web");

    let resp = client.request("list_classes", json!({"class": ""}));
    let rows = resp.data.as_array().expect("rows");
    assert!(rows.contains(&json!(["web", "web tier", 0])));

    let resp = client.request(
        "add_class",
        json!({"class": "web", "members": [], "description": ""}),
    );
    assert!(!resp.is_success());
    assert_eq!(resp.message, "class web already exists");
    assert!(!resp.temporary);

    // The successful mutation hit the disk before the response came back.
    let snapshot = state::load(&fixture.state_path())
        .expect("load")
        .expect("snapshot");
    assert!(snapshot.class("web").is_some());
}

#[test]
fn s2_resource_flow() {
    let fixture = DaemonFixture::new();
    let mut client = fixture.client();

    assert!(
        client
            .request(
                "add_resource_class",
                json!({"class": "switch", "description": ""}),
            )
            .is_success()
    );
    assert!(
        client
            .request("add_resource", json!({"resource": "sw1", "class": "switch"}))
            .is_success()
    );

    let resp = client.request(
        "rsvp_host",
        json!({"host": "sw1", "user": "alice", "expire": 0, "msg": "x"}),
    );
    assert!(!resp.is_success());
    assert!(resp.message.starts_with("sw1 is a resource"));

    let resp = client.request(
        "rsvp_host",
        json!({"host": "sw1", "user": "alice", "expire": 0, "msg": "x", "resource": 1}),
    );
    assert!(resp.is_success(), "{}", resp.message);

    let resp = client.request(
        "release_resource",
        json!({"resource": "sw1", "user": "bob", "msg": ""}),
    );
    assert!(!resp.is_success());
    assert!(resp.message.contains("not reserved by bob"));

    let resp = client.request(
        "release_resource",
        json!({"resource": "sw1", "user": "alice", "msg": ""}),
    );
    assert!(resp.is_success(), "{}", resp.message);
}

#[test]
fn s3_class_reservation_contention() {
    let fixture = DaemonFixture::new();
    fixture.add_farm_hosts(&["h1", "h2", "h3"]);
    let mut client = fixture.client();

    let resp = client.request(
        "rsvp_class",
        json!({"class": "FARM", "numhosts": 2, "user": "alice", "expire": 0, "msg": ""}),
    );
    assert!(resp.is_success(), "{}", resp.message);
    let names: Vec<String> = serde_json::from_value(resp.data).expect("names");
    assert_eq!(names.len(), 2);
    for name in &names {
        assert!(["h1", "h2", "h3"].contains(&name.as_str()));
    }

    let resp = client.request(
        "rsvp_class",
        json!({"class": "FARM", "numhosts": 2, "user": "bob", "expire": 0, "msg": ""}),
    );
    assert!(!resp.is_success());
    assert!(resp.temporary, "contention must be retryable");
    assert_eq!(resp.message, "not enough free hosts to get 2, have 1 free");
}

#[test]
fn s4_next_user_handoff() {
    let fixture = DaemonFixture::new();
    fixture.add_farm_hosts(&["h1"]);
    let mut client = fixture.client();

    let resp = client.request(
        "rsvp_host",
        json!({"host": "h1", "user": "alice", "expire": 0, "msg": "", "key": "k"}),
    );
    assert!(resp.is_success(), "{}", resp.message);

    let resp = client.request(
        "add_next_user",
        json!({"host": "h1", "user": "bob", "expire": 0, "msg": "mine"}),
    );
    assert!(resp.is_success(), "{}", resp.message);

    let resp = client.request(
        "release_rsvp",
        json!({"host": "h1", "user": "alice", "msg": "", "key": "k"}),
    );
    assert!(resp.is_success(), "{}", resp.message);
    assert_eq!(resp.message, "released h1 and reserved it for bob");

    let resp = client.request("get_current_user", json!({"host": "h1"}));
    assert_eq!(resp.data, json!("bob"));

    let resp = client.request(
        "list_hosts",
        json!({"class": "", "user": "", "verbose": 0, "next": 1}),
    );
    let rows = resp.data.as_array().expect("rows");
    assert_eq!(rows[0], json!(["h1", "bob", null, 0, ""]));
}

#[test]
fn s5_liveness_marks_dead_and_revive_restores() {
    // Seed a snapshot whose host went silent long ago.
    let dir = TempDir::new().expect("state dir");
    let state_file = dir.path().join("hosts.state");
    let mut registry = Registry::default();
    registry.ensure_defaults();
    let mut ghost = Host::new("ghost", vec!["FARM".to_string()], now_epoch());
    ghost.last_ping_time = now_epoch() - 200;
    registry.hosts.insert("ghost".into(), ghost);
    state::save(&state_file, &registry).expect("seed state");

    let config = Config {
        port: 0,
        state_file,
        ping_delay: 1,
        ..Config::default()
    };
    let server = Server::start(config, Box::new(LogNotifier), Box::new(SilentProber))
        .expect("start server");
    let mut client = Client::connect(&server);

    // The ping pass runs within a couple of seconds and finds the host
    // silent past the dead time.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let resp = client.request("get_current_user", json!({"host": "ghost"}));
        if resp.data == json!("DEATH") {
            break;
        }
        assert!(Instant::now() < deadline, "host never marked dead");
        std::thread::sleep(Duration::from_millis(200));
    }

    let resp = client.request("revive_host", json!({"host": "ghost", "all": 0}));
    assert!(resp.is_success(), "{}", resp.message);
    let resp = client.request("get_current_user", json!({"host": "ghost"}));
    assert_eq!(resp.data, Value::Null);

    server.shutdown();
}

#[test]
fn s6_wrong_key_release() {
    let fixture = DaemonFixture::new();
    fixture.add_farm_hosts(&["h1"]);
    let mut client = fixture.client();

    let resp = client.request(
        "rsvp_host",
        json!({"host": "h1", "user": "alice", "expire": 0, "msg": "", "key": "k"}),
    );
    assert!(resp.is_success(), "{}", resp.message);

    let resp = client.request(
        "release_rsvp",
        json!({"host": "h1", "user": "alice", "msg": "", "key": "wrong"}),
    );
    assert!(!resp.is_success());
    assert!(!resp.temporary);
    assert_eq!(
        resp.message,
        "Wrong key provided to release host h1: expected 'k'"
    );

    let resp = client.request(
        "release_rsvp",
        json!({"host": "h1", "user": "alice", "msg": "", "force": 1}),
    );
    assert!(resp.is_success(), "{}", resp.message);
}

#[test]
fn dumper_mode_compat() {
    let fixture = DaemonFixture::new();
    fixture.add_farm_hosts(&["h1"]);
    let mut legacy = fixture.client();

    let text = legacy.request_dumper(
        "rsvp_host",
        "$VAR1 = {'host' => 'h1','user' => 'alice','expire' => 0,'msg' => ''};",
    );
    assert!(text.contains("'type' => 'success'"), "{text}");
    assert!(text.contains("reserved h1"), "{text}");

    // A frame outside the whitelist is dropped, and the connection keeps
    // working for well-formed requests.
    let frame = format!("rsvp_host {}\n", hex::encode("$VAR1 = [sub { die }];"));
    legacy.stream.write_all(frame.as_bytes()).expect("send");

    let text = legacy.request_dumper("verify_rsvp", "{'host' => 'h1','user' => 'alice'}");
    assert!(text.contains("'type' => 'success'"), "{text}");
}

#[test]
fn malformed_requests_get_permanent_errors() {
    let fixture = DaemonFixture::new();
    let mut client = fixture.client();

    let resp = client.request("warp_speed", json!({}));
    assert!(!resp.is_success());
    assert!(!resp.temporary);
    assert!(resp.message.contains("unknown command"));

    let resp = client.request("del_host", json!({}));
    assert!(!resp.is_success());
    assert!(resp.message.contains("missing required parameter"));

    let resp = client.request("del_host", json!({"host": "h", "extra": 1}));
    assert!(!resp.is_success());
    assert!(resp.message.contains("unknown parameter"));

    let resp = client.request(
        "list_hosts",
        json!({"class": "", "user": "", "verbose": 0, "hostRegexp": "["}),
    );
    assert!(!resp.is_success());
    assert!(!resp.temporary);
}

#[test]
fn listings_and_modify_flow() {
    let fixture = DaemonFixture::new();
    let mut client = fixture.client();

    for cmd in [
        ("add_class", json!({"class": "web", "members": [], "description": "web tier"})),
        ("add_class", json!({"class": "db", "members": [], "description": ""})),
        ("add_host", json!({"host": "h1", "classes": ["web"]})),
        ("add_host", json!({"host": "h2", "classes": ["web", "db"]})),
    ] {
        let resp = client.request(cmd.0, cmd.1);
        assert!(resp.is_success(), "{}", resp.message);
    }

    // Intersection semantics for multi-name expressions.
    let resp = client.request(
        "list_hosts",
        json!({"class": "web,db", "user": "", "verbose": 0}),
    );
    let rows = resp.data.as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], json!("h2"));

    let resp = client.request(
        "modify_host",
        json!({"host": "h1", "user": "ops", "addClasses": ["db"], "delClasses": ["web"]}),
    );
    assert!(resp.is_success(), "{}", resp.message);

    let resp = client.request(
        "list_hosts",
        json!({"class": "", "user": "", "verbose": 1}),
    );
    let rows = resp.data.as_array().expect("rows");
    assert!(rows.contains(&json!(["h1", null, "db"])));

    // del_class cascades out of host class lists.
    let resp = client.request("del_class", json!({"class": "db"}));
    assert!(resp.is_success(), "{}", resp.message);
    let resp = client.request(
        "list_hosts",
        json!({"class": "", "user": "", "verbose": 1}),
    );
    let rows = resp.data.as_array().expect("rows");
    assert!(rows.contains(&json!(["h1", null, ""])));
}
