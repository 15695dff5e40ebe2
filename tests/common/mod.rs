//! Shared test utilities for integration tests
//!
//! A minimal canned-response HTTP server so the fetch pipeline can be
//! exercised end to end without the network, plus request counters for
//! asserting that revision-skipped runs fetch nothing.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Route {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Route {
    pub fn new(body: impl Into<Vec<u8>>, etag: &str) -> Route {
        Route {
            body: body.into(),
            etag: Some(etag.to_string()),
            last_modified: None,
        }
    }
}

pub struct TestServer {
    base: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    gets: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let gets = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(AtomicUsize::new(0));

        {
            let routes = Arc::clone(&routes);
            let gets = Arc::clone(&gets);
            let heads = Arc::clone(&heads);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let _ = serve(stream, &routes, &gets, &heads);
                }
            });
        }

        TestServer {
            base,
            routes,
            gets,
            heads,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn set(&self, path: &str, route: Route) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), route);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn head_count(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

fn serve(
    stream: TcpStream,
    routes: &Mutex<HashMap<String, Route>>,
    gets: &AtomicUsize,
    heads: &AtomicUsize,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    // Drain the remaining request headers.
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line == "\r\n" || line.is_empty() {
            break;
        }
    }

    let route = routes.lock().unwrap().get(&path).cloned();
    let mut stream = reader.into_inner();

    let Some(route) = route else {
        stream.write_all(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )?;
        return Ok(());
    };

    match method.as_str() {
        "HEAD" => heads.fetch_add(1, Ordering::SeqCst),
        _ => gets.fetch_add(1, Ordering::SeqCst),
    };

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n",
        route.body.len()
    );
    if let Some(etag) = &route.etag {
        response.push_str(&format!("ETag: {etag}\r\n"));
    }
    if let Some(last_modified) = &route.last_modified {
        response.push_str(&format!("Last-Modified: {last_modified}\r\n"));
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes())?;
    if method != "HEAD" {
        stream.write_all(&route.body)?;
    }
    Ok(())
}

/// Build a tar archive of `(path, content)` file members in memory.
pub fn tar_of(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in members {
        let mut header = tar::Header::new_gnu();
        let path_bytes = path.as_bytes();
        header.as_old_mut().name[..path_bytes.len()].copy_from_slice(path_bytes);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        builder
            .append(&header, std::io::Cursor::new(content))
            .expect("append member");
    }
    builder.into_inner().expect("finish tar")
}
