mod util;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::thread::sleep;
use std::time::Duration;

use util::{write_request, Response, Server};

fn test_forward(args: &[&str], url: &str, host: &str, location: &str) {
    let server = Server::with_args(args);
    let response = server.get(url, map! { "Host" => host });

    assert_eq!(response.status(), "301 Moved Permanently");
    assert_eq!(response.header("Location"), Some(location));
    assert!(response.text().unwrap().contains(location));
}

const FORWARD_ARGS: &[&str] = &[
    "--forward",
    "example.com",
    "http://www.example.com",
    "--forward",
    "secure.example.com",
    "https://www.example.com/secure",
];

#[test]
fn forward_root() {
    test_forward(FORWARD_ARGS, "/", "example.com", "http://www.example.com/");
}

#[test]
fn forward_relative() {
    test_forward(
        FORWARD_ARGS,
        "/foo/bar",
        "secure.example.com",
        "https://www.example.com/secure/foo/bar",
    );
}

const FORWARD_ALL_ARGS: &[&str] = &[
    "--forward",
    "example.com",
    "http://www.example.com",
    "--forward-all",
    "http://catchall.example.com",
];

#[test]
fn forward_all_root() {
    test_forward(
        FORWARD_ALL_ARGS,
        "/",
        "not-example.com",
        "http://catchall.example.com/",
    );
}

#[test]
fn forward_all_relative() {
    test_forward(
        FORWARD_ALL_ARGS,
        "/foo/bar",
        "still-not.example.com",
        "http://catchall.example.com/foo/bar",
    );
}

#[test]
fn forward_https() {
    test_forward(
        &["--forward-https"],
        "/a?b",
        "example.com",
        "https://example.com/a?b",
    );
}

#[test]
fn forward_https_behind_https_proxy() {
    let server = Server::with_args(&["--forward-https"]);
    let response = server.get(
        "/",
        map! { "Host" => "example.com", "X-Forwarded-Proto" => "https" },
    );
    assert_eq!(response.status(), "200 OK");
}

#[test]
fn forward_https_needs_host() {
    let server = Server::with_args(&["--forward-https"]);
    let response = server.get("/", HashMap::new());
    assert_eq!(response.status(), "400 Bad Request");
}

fn test_server_id(args: &[&str], server_id: bool) {
    let server = Server::with_args(args);
    let response = server.get("/", HashMap::new());

    assert_eq!(response.status(), "200 OK");
    assert_eq!(response.header("Server").is_some(), server_id);
    assert_eq!(response.text().unwrap().contains("Generated by"), server_id);
}

#[test]
fn no_server_id() {
    test_server_id(&["--no-server-id"], false);
}

#[test]
fn server_id() {
    test_server_id(&[], true);
}

fn test_listing(args: &[&str], listing: bool) {
    let server = Server::with_args(args);
    server.create_file("a file.txt", b"contents");
    server.create_dir("subdir");
    let response = server.get("/", HashMap::new());

    if listing {
        assert_eq!(response.status(), "200 OK");
        let body = response.text().unwrap();
        assert!(body.contains("<a href=\"a%20file.txt\">a file.txt</a>"));
        assert!(body.contains("<a href=\"subdir/\">subdir</a>/"));
    } else {
        assert_eq!(response.status(), "404 Not Found");
    }
}

#[test]
fn no_listing() {
    test_listing(&["--no-listing"], false);
}

#[test]
fn listing() {
    test_listing(&[], true);
}

#[test]
fn index_file() {
    let server = Server::with_args(&["--index", "home.htm"]);
    server.create_file("home.htm", b"<p>home</p>");
    let response = server.get("/", HashMap::new());
    assert_eq!(response.status(), "200 OK");
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.text(), Some("<p>home</p>"));
}

#[test]
fn directory_redirect() {
    let server = Server::with_args(&[]);
    server.create_dir("docs");
    let response = server.get("/docs?x=1", HashMap::new());
    assert_eq!(response.status(), "301 Moved Permanently");
    assert_eq!(response.header("Location"), Some("/docs/?x=1"));
}

#[test]
fn missing_file() {
    let server = Server::with_args(&[]);
    let response = server.get("/nope.txt", HashMap::new());
    assert_eq!(response.status(), "404 Not Found");
}

#[test]
fn escaping_the_root() {
    let server = Server::with_args(&[]);
    let response = server.get("/../etc/passwd", HashMap::new());
    assert_eq!(response.status(), "400 Bad Request");
    let response = server.get("/%2e%2e/etc/passwd", HashMap::new());
    assert_eq!(response.status(), "400 Bad Request");
}

#[test]
fn unsupported_method() {
    let server = Server::with_args(&[]);
    let mut stream = server.stream();
    write_request(&mut stream, "POST", "/", &HashMap::new());
    let response = Response::from_reader(&mut stream, true).unwrap();
    assert_eq!(response.status(), "501 Not Implemented");
}

#[test]
fn request_too_large() {
    let server = Server::with_args(&[]);
    let mut stream = server.stream();
    // Fill the receive buffer exactly, so nothing is left unread when the server closes.
    let mut request = String::from("GET / HTTP/1.1\nX-Padding: ");
    request.push_str(&"x".repeat(4000 - request.len()));
    stream.write_all(request.as_bytes()).unwrap();
    let response = Response::from_reader(&mut stream, true).unwrap();
    assert_eq!(response.status(), "413 Request Entity Too Large");
}

fn test_auth(auth: Option<&str>, authorized: bool) {
    let server = Server::with_args(&["--auth", "myuser:mypass"]);
    let mut request_headers = HashMap::new();
    if let Some(auth) = auth {
        request_headers.insert("Authorization", auth);
    }
    let response = server.get("/", request_headers);

    if authorized {
        assert_eq!(response.status(), "200 OK");
        assert_eq!(response.header("WWW-Authenticate"), None);
    } else {
        assert_eq!(response.status(), "401 Unauthorized");
        assert_eq!(
            response.header("WWW-Authenticate"),
            Some("Basic realm=\"User Visible Realm\"")
        );
    }
}

#[test]
fn no_auth() {
    test_auth(None, false);
}

#[test]
fn with_auth() {
    test_auth(Some("Basic bXl1c2VyOm15cGFzcw=="), true);
}

#[test]
fn wrong_auth() {
    test_auth(Some("Basic bXl1c2VyOndyb25ncGFzcw=="), false);
}

#[test]
fn mimemap() {
    let mimemap_lines = [
        "test/type1 a1",
        "test/this-gets-replaced  ap2",
        "# this is a comment",
        "test/type3\tapp3\r",
        "test/type2  ap2",
        "  test/foo foo",
        "test/colon: col",
        "",
    ];
    // The map file has to exist before the server starts.
    let dir = tempfile::tempdir().unwrap();
    let mimemap_path = dir.path().join("mimemap");
    fs::write(&mimemap_path, mimemap_lines.join("\n")).unwrap();
    let server = Server::with_args(&[
        "--mimetypes",
        mimemap_path.to_str().unwrap(),
        "--default-mimetype",
        "test/default",
    ]);
    let files = [
        ("test-file.a1", "test/type1"),
        ("test-file.ap2", "test/type2"),
        ("test-file.app3", "test/type3"),
        ("test-file.appp4", "test/default"),
        ("test-file.foo", "test/foo"),
        ("test-file.col", "test/colon"),
    ];
    for (filename, content_type) in files {
        server.create_file(filename, b"");
        let response = server.get(&format!("/{}", filename), HashMap::new());
        assert_eq!(response.status(), "200 OK");
        assert_eq!(response.header("Content-Type"), Some(content_type));
    }
}

#[test]
fn timeout() {
    let server = Server::with_args(&["--timeout", "1"]);
    let mut stream = server.stream();
    let mut buf = String::new();
    // expect EOF before read timeout expires
    assert_eq!(stream.read_to_string(&mut buf).unwrap(), 0);
}

#[test]
fn range() {
    let server = Server::with_args(&[]);
    server.create_file("digits", b"0123456789");

    let response = server.get("/digits", map! { "Range" => "bytes=2-4" });
    assert_eq!(response.status(), "206 Partial Content");
    assert_eq!(response.header("Content-Range"), Some("bytes 2-4/10"));
    assert_eq!(response.text(), Some("234"));

    let response = server.get("/digits", map! { "Range" => "bytes=-3" });
    assert_eq!(response.header("Content-Range"), Some("bytes 7-9/10"));
    assert_eq!(response.text(), Some("789"));

    let response = server.get("/digits", map! { "Range" => "bytes=8-" });
    assert_eq!(response.text(), Some("89"));
}

#[test]
fn range_not_satisfiable() {
    let server = Server::with_args(&[]);
    server.create_file("digits", b"0123456789");
    for range in ["bytes=10-", "bytes=5-2", "lines=1-2"] {
        let response = server.get("/digits", map! { "Range" => range });
        assert_eq!(response.status(), "416 Requested Range Not Satisfiable");
        assert_eq!(response.header("Content-Range"), Some("bytes */10"));
    }
}

#[test]
fn head() {
    let server = Server::with_args(&[]);
    server.create_file("digits", b"0123456789");
    let response = server.head("/digits", HashMap::new());
    assert_eq!(response.status(), "200 OK");
    assert_eq!(response.header("Content-Length"), Some("10"));
    assert_eq!(response.body, None);
}

#[test]
fn not_modified() {
    let server = Server::with_args(&[]);
    server.create_file("digits", b"0123456789");
    let response = server.get("/digits", HashMap::new());
    let last_modified = response.header("Last-Modified").unwrap().to_string();

    let mut stream = server.stream();
    write_request(
        &mut stream,
        "GET",
        "/digits",
        &map! { "If-Modified-Since" => last_modified.as_str() },
    );
    let response = Response::from_reader(&mut stream, false).unwrap();
    assert_eq!(response.status(), "304 Not Modified");
    assert_eq!(response.header("Content-Length"), None);

    let response = server.get(
        "/digits",
        map! { "If-Modified-Since" => "Thu, 01 Jan 1970 00:00:00 GMT" },
    );
    assert_eq!(response.status(), "200 OK");
}

#[test]
fn keep_alive() {
    let server = Server::with_args(&[]);
    server.create_file("digits", b"0123456789");
    let mut stream = server.stream();
    for _ in 0..3 {
        write_request(&mut stream, "GET", "/digits", &HashMap::new());
        let response = Response::from_reader(&mut stream, true).unwrap();
        assert_eq!(response.status(), "200 OK");
        assert_eq!(response.header("Keep-Alive"), Some("timeout=30"));
        assert_eq!(response.text(), Some("0123456789"));
    }
}

#[test]
fn keep_alive_request_limit() {
    let server = Server::with_args(&["--max-requests", "2"]);
    let mut stream = server.stream();

    write_request(&mut stream, "GET", "/", &HashMap::new());
    let response = Response::from_reader(&mut stream, true).unwrap();
    assert_eq!(response.header("Keep-Alive"), Some("timeout=30,max=1"));

    write_request(&mut stream, "GET", "/", &HashMap::new());
    let response = Response::from_reader(&mut stream, true).unwrap();
    assert_eq!(response.header("Connection"), Some("close"));

    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn no_keepalive() {
    let server = Server::with_args(&["--no-keepalive"]);
    let response = server.get("/", HashMap::new());
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.header("Keep-Alive"), None);
}

#[test]
fn custom_headers() {
    let server = Server::with_args(&[
        "--header",
        "X-Frame-Options: DENY",
        "--header",
        "Cache-Control: no-store",
    ]);
    let response = server.get("/", HashMap::new());
    assert_eq!(response.header("X-Frame-Options"), Some("DENY"));
    assert_eq!(response.header("Cache-Control"), Some("no-store"));
}

#[test]
fn access_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let server = Server::with_args(&["--log", log_path.to_str().unwrap()]);
    let response = server.get("/", map! { "User-Agent" => "integration-test" });
    assert_eq!(response.status(), "200 OK");

    let mut log = String::new();
    for _ in 0..1000 {
        log = fs::read_to_string(&log_path).unwrap();
        if !log.is_empty() {
            break;
        }
        sleep(Duration::from_millis(1));
    }
    assert!(log.starts_with("127.0.0.1 - - ["));
    assert!(log.contains("\"GET / HTTP/1.1\" 200 "));
    assert!(log.trim_end().ends_with("\"\" \"integration-test\""));
}

#[test]
fn pidfile() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("darkerhttpd.pid");
    let server = Server::with_args(&["--pidfile", pid_path.to_str().unwrap()]);
    // written after the socket opens
    let mut contents = String::new();
    for _ in 0..1000 {
        contents = fs::read_to_string(&pid_path).unwrap_or_default();
        if !contents.is_empty() {
            break;
        }
        sleep(Duration::from_millis(1));
    }
    assert_eq!(contents.parse::<u32>().unwrap(), server.pid());
}
