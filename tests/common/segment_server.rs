//! Minimal HTTP/1.1 server with scripted replies per path, for integration tests.
//!
//! Every path has a list of replies; request N gets reply N and the last reply repeats.
//! Unknown paths get 404. Connections are closed after each response.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    /// Slept before the response is written.
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: format!("status {}", status).into_bytes(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct Route {
    replies: Vec<Reply>,
    hits: usize,
}

#[derive(Clone)]
pub struct SegmentServer {
    base: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

impl SegmentServer {
    /// Starts the server in a background thread. It runs until the process exits.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let shared = Arc::clone(&routes);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let routes = Arc::clone(&shared);
                thread::spawn(move || handle(stream, &routes));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{}", port),
            routes,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn route(&self, path: &str, replies: Vec<Reply>) {
        assert!(!replies.is_empty(), "a route needs at least one reply");
        let key = format!("/{}", path.trim_start_matches('/'));
        self.routes.lock().unwrap().insert(key, Route { replies, hits: 0 });
    }

    pub fn hits(&self, path: &str) -> usize {
        let key = format!("/{}", path.trim_start_matches('/'));
        self.routes.lock().unwrap().get(&key).map_or(0, |r| r.hits)
    }

    /// Serves `<name>/playlist.m3u8` listing one relative `seg<i>.ts` per reply list.
    /// Returns the playlist URL.
    pub fn media(&self, name: &str, segments: Vec<Vec<Reply>>) -> String {
        let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
        for (i, replies) in segments.into_iter().enumerate() {
            playlist.push_str(&format!("#EXTINF:10.0,\nseg{}.ts\n", i));
            self.route(&format!("{}/seg{}.ts", name, i), replies);
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        self.route(&format!("{}/playlist.m3u8", name), vec![Reply::ok(playlist)]);
        self.url(&format!("{}/playlist.m3u8?token=signed", name))
    }

    /// Like `media` with one immediate 200 per body.
    pub fn simple_media(&self, name: &str, bodies: &[&str]) -> String {
        self.media(
            name,
            bodies.iter().map(|b| vec![Reply::ok(b.as_bytes())]).collect(),
        )
    }
}

fn handle(mut stream: TcpStream, routes: &Mutex<HashMap<String, Route>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let request = String::from_utf8_lossy(&request);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    let path = path.split('?').next().unwrap_or(path).to_string();

    let reply = {
        let mut routes = routes.lock().unwrap();
        match routes.get_mut(&path) {
            Some(route) => {
                let reply = route.replies[route.hits.min(route.replies.len() - 1)].clone();
                route.hits += 1;
                reply
            }
            None => Reply::status(404),
        }
    };

    if !reply.delay.is_zero() {
        thread::sleep(reply.delay);
    }
    let head = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&reply.body);
    let _ = stream.flush();
}
