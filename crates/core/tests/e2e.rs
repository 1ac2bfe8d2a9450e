//! End-to-end exchanges between a client on one window and servers on
//! another, asserted both on resolved values and on observable wire
//! traffic.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Duration;

use transom_core::http::SendOptions;
use transom_core::prelude::*;
use transom_core::proto::{Frame, PROTOCOL_VERSION, kind};
use transom_core::stream::StreamOptions;
use transom_core::test_util::{WireTap, settle, window_pair};
use transom_core::{ClientResponse, ServerRequest as Req, ServerResponse as Res};

fn quick_client(parent: &Window, frame: &Window) -> Client {
    Client::connect(
        parent,
        frame,
        ClientOptions {
            ack_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            async_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(400),
            ..Default::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synchronous_round_trip_with_expected_wire_traffic() {
    let (parent, frame) = window_pair();
    let parent_tap = WireTap::attach(&parent);

    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/u", |req: Req, _res: Res| async move {
        let id = req.body_json().and_then(|b| b["id"].as_u64());
        assert_eq!(id, Some(7));
        Ok(Some(json!({"name": "a"})))
    });

    let client = quick_client(&parent, &frame);
    let reply = client.send("/u", json!({"id": 7})).await.expect("reply");

    assert_eq!(reply.status, 200);
    assert_eq!(reply.status_text, "OK");
    let body: Value = reply.json().expect("json");
    assert_eq!(body, json!({"name": "a"}));

    settle().await;
    // The requester observes exactly a claim notice and the reply, in
    // that order, both addressed to it.
    let kinds = parent_tap.kinds();
    assert_eq!(kinds, vec!["ack", "response"]);
    for frame in parent_tap.frames() {
        assert_eq!(frame.request_id, reply.request_id);
        assert_eq!(frame.target_id.as_deref(), Some(client.id()));
        assert_eq!(frame.creator_id.as_deref(), Some(server.id()));
        assert_eq!(frame.version, PROTOCOL_VERSION);
    }

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_handler_without_response_reports_no_response() {
    let (parent, frame) = window_pair();
    let parent_tap = WireTap::attach(&parent);

    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/u", |_req: Req, _res: Res| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(None)
    });

    let client = quick_client(&parent, &frame);
    let error = client.send("/u", json!(null)).await.expect_err("must fail");

    assert_eq!(error.code(), Some(ErrorCode::RequestError));
    assert!(error.to_string().contains("NO_RESPONSE"));

    settle().await;
    assert_eq!(parent_tap.kinds(), vec!["ack", "async", "error"]);
    let failure = &parent_tap.of_kind(kind::ERROR)[0];
    assert_eq!(failure.status, Some(500));

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrouted_path_yields_exactly_one_not_found_across_servers() {
    let (parent, frame) = window_pair();
    let parent_tap = WireTap::attach(&parent);

    // Two co-resident servers share the window; neither knows the path.
    let first = Server::bind(&frame, ServerOptions::default());
    let second = Server::bind(&frame, ServerOptions::default());

    let client = quick_client(&parent, &frame);
    let error = client.send("/z", json!(null)).await.expect_err("must fail");
    assert_eq!(error.code(), Some(ErrorCode::MethodNotFound));
    let failure = error.failure().expect("failure record");
    assert_eq!(failure.status, Some(404));

    settle().await;
    // No claim notice for an unrouted path, and exactly one failure even
    // with two servers racing.
    assert_eq!(parent_tap.kinds(), vec!["error"]);

    client.destroy();
    first.destroy();
    second.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_reply_when_two_servers_share_a_window() {
    let (parent, frame) = window_pair();
    let parent_tap = WireTap::attach(&parent);

    let first = Server::bind(&frame, ServerOptions::default());
    first.on("/answered", |_req: Req, _res: Res| async move {
        Ok(Some(json!("from-first")))
    });
    let second = Server::bind(&frame, ServerOptions::default());
    second.on("/answered", |_req: Req, _res: Res| async move {
        Ok(Some(json!("from-second")))
    });

    let client = quick_client(&parent, &frame);
    let reply = client.send("/answered", json!(null)).await.expect("reply");
    let winner: String = reply.json().expect("json");
    assert_eq!(winner, "from-first");

    settle().await;
    assert_eq!(parent_tap.of_kind(kind::RESPONSE).len(), 1);
    assert_eq!(parent_tap.of_kind(kind::ACK).len(), 1);

    client.destroy();
    first.destroy();
    second.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn route_params_and_wildcards_capture() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/users/:id/files/*", |req: Req, _res: Res| async move {
        Ok(Some(json!({
            "id": req.param("id"),
            "rest": req.param("0"),
        })))
    });

    let client = quick_client(&parent, &frame);
    let reply = client
        .send("/users/42/files/docs/a.txt", json!(null))
        .await
        .expect("reply");
    let body: Value = reply.json().expect("json");
    assert_eq!(body, json!({"id": "42", "rest": "docs/a.txt"}));

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn middleware_runs_in_order_and_can_short_circuit() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());

    server.hoop(|req: Req, _res: Res| async move {
        req.with_depot(|depot| {
            depot.insert("trail", vec!["outer".to_owned()]);
        });
        Ok(())
    });
    server.hoop_at("/guarded", |_req: Req, res: Res| async move {
        res.status(403).send(json!({"denied": true})).await?;
        Ok(())
    });
    server.on("/guarded/secret", |_req: Req, _res: Res| async move {
        panic!("handler must not run after a middleware replied")
    });
    server.on("/open", |req: Req, _res: Res| async move {
        let trail = req.with_depot(|depot| depot.get::<Vec<String>>("trail").cloned());
        Ok(Some(json!({"trail": trail})))
    });

    let client = quick_client(&parent, &frame);

    let reply = client.send("/open", json!(null)).await.expect("reply");
    let body: Value = reply.json().expect("json");
    assert_eq!(body, json!({"trail": ["outer"]}));

    let denied = client.send("/guarded/secret", json!(null)).await.expect("reply");
    assert_eq!(denied.status, 403);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn middleware_failure_becomes_a_500_reply() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.hoop(|_req: Req, _res: Res| async move {
        Err(Error::Other("auth backend unreachable".into()))
    });
    server.on("/anything", |_req: Req, _res: Res| async move {
        Ok(Some(json!("unreachable")))
    });

    let client = quick_client(&parent, &frame);
    let reply = client.send("/anything", json!(null)).await.expect("reply");
    assert_eq!(reply.status, 500);
    let body: Value = reply.json().expect("json");
    assert!(
        body["error"]
            .as_str()
            .expect("message")
            .contains("auth backend unreachable")
    );

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_connect_succeeds_and_learns_the_peer_id() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    let client = quick_client(&parent, &frame);

    assert!(client.is_connect().await);
    assert_eq!(client.peer_id().as_deref(), Some(server.id()));

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_connect_times_out_without_a_peer() {
    let (parent, frame) = window_pair();
    let client = quick_client(&parent, &frame);
    assert!(!client.is_connect().await);
    client.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_connect_ignores_answers_from_the_wrong_origin() {
    let parent = Window::new("https://parent.test");
    let frame = Window::new("https://ok.test");
    let rogue = Window::new("https://bad.test");

    // No server lives on the frame; a rogue window fakes the claim.
    let frame_tap = WireTap::attach(&frame);
    let client = Client::connect(
        &parent,
        &frame,
        ClientOptions {
            target_origin: "https://ok.test".to_owned(),
            connect_timeout: Duration::from_millis(400),
            ..Default::default()
        },
    );

    let probe = tokio::spawn({
        let client = client.clone();
        async move { client.is_connect().await }
    });

    // Wait for the probe to hit the wire, then answer it from elsewhere.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ping = &frame_tap.of_kind(kind::PING)[0];
    let mut fake = Frame::new(kind::ACK, ping.request_id.clone());
    fake.role = Some(transom_core::Role::Server);
    fake.creator_id = Some("rogue".to_owned());
    rogue.post_message(&parent, fake.encode().expect("encode"), "*");

    assert!(!probe.await.expect("join"), "wrong-origin ack must not count");
    assert_eq!(client.peer_id(), None);
    client.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_download_auto_resolves_to_a_file() {
    let (parent, frame) = window_pair();
    let parent_tap = WireTap::attach(&parent);

    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/download", |_req: Req, res: Res| async move {
        res.send_file(
            "Hello World",
            transom_core::FileStreamOptions {
                file_name: Some("greeting.txt".into()),
                mime_type: Some("text/plain".into()),
                ..Default::default()
            },
        )
        .await?;
        Ok(None)
    });

    let client = quick_client(&parent, &frame);
    let reply = client.send("/download", json!(null)).await.expect("reply");

    let file = reply.data.as_file().expect("materialized file");
    assert_eq!(file.name(), "greeting.txt");
    assert_eq!(file.mime_type(), "text/plain");
    assert_eq!(file.size(), 11);
    assert_eq!(file.text(), "Hello World");

    settle().await;
    let kinds = parent_tap.kinds();
    assert_eq!(kinds, vec!["ack", "stream_start", "stream_data", "stream_end"]);

    let start = &parent_tap.of_kind(kind::STREAM_START)[0];
    let body = start.body.as_ref().expect("start body");
    assert_eq!(body["type"], "file");
    assert_eq!(body["chunked"], false);
    assert_eq!(body["autoResolve"], true);
    assert_eq!(body["metadata"]["filename"], "greeting.txt");
    assert_eq!(body["metadata"]["mimeType"], "text/plain");

    let data = &parent_tap.of_kind(kind::STREAM_DATA)[0];
    let body = data.body.as_ref().expect("data body");
    assert_eq!(body["data"], "SGVsbG8gV29ybGQ=");
    assert_eq!(body["done"], true);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_upload_auto_resolves_before_the_handler_runs() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/upload", |req: Req, _res: Res| async move {
        let IncomingBody::File(file) = req.take_body() else {
            return Ok(Some(json!({"error": "expected a materialized file"})));
        };
        Ok(Some(json!({
            "name": file.name(),
            "size": file.size(),
            "text": file.text(),
        })))
    });

    let client = quick_client(&parent, &frame);
    let reply = client
        .send_file(
            "/upload",
            "chunked upload payload",
            transom_core::FileStreamOptions {
                file_name: Some("payload.bin".into()),
                chunk_size: 4,
                ..Default::default()
            },
        )
        .await
        .expect("reply");

    let body: Value = reply.json().expect("json");
    assert_eq!(body["name"], "payload.bin");
    assert_eq!(body["size"], 22);
    assert_eq!(body["text"], "chunked upload payload");

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_request_body_reaches_the_handler_in_order() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/sum", |req: Req, _res: Res| async move {
        let IncomingBody::Stream(mut stream) = req.take_body() else {
            return Ok(Some(json!({"error": "expected a stream"})));
        };
        let chunks = stream.read().await?;
        let total: u64 = chunks.iter().filter_map(Value::as_u64).sum();
        Ok(Some(json!({"chunks": chunks.len(), "total": total})))
    });

    let client = quick_client(&parent, &frame);
    let stream = WritableStream::from_iter(
        (1..=30u64).map(Value::from).collect::<Vec<_>>(),
        StreamOptions::default(),
    );
    let reply = client.send_stream("/sum", stream).await.expect("reply");
    let body: Value = reply.json().expect("json");
    assert_eq!(body, json!({"chunks": 30, "total": 465}));

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_reply_body_can_be_read_chunk_by_chunk() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/feed", |_req: Req, res: Res| async move {
        let stream = WritableStream::from_iter(
            ["alpha", "beta", "gamma"].map(Value::from).to_vec(),
            StreamOptions::default(),
        );
        res.send_stream(stream).await?;
        Ok(None)
    });

    let client = quick_client(&parent, &frame);
    let reply = client.send("/feed", json!(null)).await.expect("reply");
    let IncomingBody::Stream(mut stream) = reply.data else {
        panic!("expected a reply stream");
    };
    let chunks = stream.read().await.expect("chunks");
    assert_eq!(chunks, vec![json!("alpha"), json!("beta"), json!("gamma")]);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn receipt_confirmed_reply_resolves_true_for_the_sender() {
    let (parent, frame) = window_pair();
    let confirmed = Arc::new(Mutex::new(None));

    let server = Server::bind(&frame, ServerOptions::default());
    {
        let confirmed = Arc::clone(&confirmed);
        server.on("/important", move |_req: Req, res: Res| {
            let confirmed = Arc::clone(&confirmed);
            async move {
                let got = res
                    .send_with(
                        json!({"critical": true}),
                        SendOptions {
                            require_ack: true,
                            ack_wait: Duration::from_secs(2),
                            ..Default::default()
                        },
                    )
                    .await?;
                *confirmed.lock() = Some(got);
                Ok(None)
            }
        });
    }

    let client = quick_client(&parent, &frame);
    let reply = client.send("/important", json!(null)).await.expect("reply");
    assert_eq!(reply.status, 200);

    settle().await;
    assert_eq!(*confirmed.lock(), Some(true), "receipt ack must arrive");

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_secret_keys_never_meet() {
    let (parent, frame) = window_pair();
    let server = Server::bind(
        &frame,
        ServerOptions {
            secret_key: Some("tenant-a".into()),
            ..Default::default()
        },
    );
    server.on("/u", |_req: Req, _res: Res| async move { Ok(Some(json!(1))) });

    let client = Client::connect(
        &parent,
        &frame,
        ClientOptions {
            secret_key: Some("tenant-b".into()),
            ack_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let error = client.send("/u", json!(null)).await.expect_err("must fail");
    assert_eq!(error.code(), Some(ErrorCode::AckTimeout));

    // Matching keys do meet.
    let matching = Client::connect(
        &parent,
        &frame,
        ClientOptions {
            secret_key: Some("tenant-a".into()),
            ..Default::default()
        },
    );
    let reply = matching.send("/u", json!(null)).await.expect("reply");
    let value: u32 = reply.json().expect("json");
    assert_eq!(value, 1);

    client.destroy();
    matching.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_addressed_to_another_endpoint_is_ignored() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/u", |_req: Req, _res: Res| async move { Ok(Some(json!(1))) });

    let client = quick_client(&parent, &frame);
    let error = client
        .send_with(
            "/u",
            json!(null),
            transom_core::SendRequestOptions {
                target_id: Some("nobody-home".into()),
                ack_timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        )
        .await
        .expect_err("must time out");
    assert_eq!(error.code(), Some(ErrorCode::AckTimeout));

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_peer_version_rejects_the_waiter() {
    let (parent, frame) = window_pair();
    let frame_tap = WireTap::attach(&frame);
    let rogue = Window::new("https://old.test");

    let client = Client::connect(
        &parent,
        &frame,
        ClientOptions {
            ack_timeout: Duration::from_secs(3),
            ..Default::default()
        },
    );

    let send = tokio::spawn({
        let client = client.clone();
        async move { client.send("/u", json!(null)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let request = &frame_tap.of_kind(kind::REQUEST)[0];
    let mut stale = Frame::new(kind::RESPONSE, request.request_id.clone());
    stale.version = 0;
    stale.role = Some(transom_core::Role::Server);
    stale.status = Some(200);
    rogue.post_message(&parent, stale.encode().expect("encode"), "*");

    let error = send.await.expect("join").expect_err("must fail");
    assert_eq!(error.code(), Some(ErrorCode::ProtocolUnsupported));
    let message = error.to_string();
    assert!(message.contains('0'), "carries the offending version");
    assert!(message.contains('1'), "carries the supported minimum");

    client.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_peer_window_fails_fast() {
    let (parent, frame) = window_pair();
    let client = quick_client(&parent, &frame);
    frame.close();
    let error = client.send("/u", json!(null)).await.expect_err("must fail");
    assert_eq!(error.code(), Some(ErrorCode::TargetWindowClosed));
    client.destroy();
}

#[cfg(feature = "cookie")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_cookie_then_removal_round_trip() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/login", |_req: Req, res: Res| async move {
        res.cookie(cookie::Cookie::build(("sid", "s-123")).path("/").build());
        Ok(Some(json!({"ok": true})))
    });
    server.on("/logout", |_req: Req, res: Res| async move {
        res.clear_cookie("sid");
        Ok(Some(json!({"ok": true})))
    });
    server.on("/whoami", |req: Req, _res: Res| async move {
        Ok(Some(json!({"sid": req.cookie("sid")})))
    });

    let client = quick_client(&parent, &frame);

    client.send("/login", json!(null)).await.expect("login");
    assert_eq!(client.cookies().get("sid").as_deref(), Some("s-123"));

    let whoami = client.send("/whoami", json!(null)).await.expect("whoami");
    let body: Value = whoami.json().expect("json");
    assert_eq!(body, json!({"sid": "s-123"}));

    client.send("/logout", json!(null)).await.expect("logout");
    assert_eq!(client.cookies().get("sid"), None);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interceptors_rewrite_requests_and_observe_replies() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    server.on("/rewritten", |req: Req, _res: Res| async move {
        Ok(Some(json!({"stamp": req.header("x-stamp")})))
    });

    let client = quick_client(&parent, &frame);
    client.request_interceptors().use_fn(|mut config| {
        config.headers.set("x-stamp", "intercepted");
        Ok(config)
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client.response_interceptors().use_fn(move |reply: ClientResponse| {
            seen.lock().push(reply.status);
            Ok(reply)
        });
    }

    let reply = client.send("/rewritten", json!(null)).await.expect("reply");
    let body: Value = reply.json().expect("json");
    assert_eq!(body, json!({"stamp": "intercepted"}));
    assert_eq!(*seen.lock(), vec![200]);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_cancel_stops_the_producer() {
    let (parent, frame) = window_pair();
    let producer_handle: Arc<Mutex<Option<WritableStream>>> = Arc::new(Mutex::new(None));

    let server = Server::bind(&frame, ServerOptions::default());
    {
        let producer_handle = Arc::clone(&producer_handle);
        server.on("/tail", move |_req: Req, res: Res| {
            let producer_handle = Arc::clone(&producer_handle);
            async move {
                let mut n = 0u64;
                let endless = WritableStream::from_next(
                    move || {
                        n += 1;
                        Some(Ok(json!(n)))
                    },
                    StreamOptions::default(),
                );
                *producer_handle.lock() = Some(endless.clone());
                res.send_stream(endless).await?;
                Ok(None)
            }
        });
    }

    let client = quick_client(&parent, &frame);
    let reply = client.send("/tail", json!(null)).await.expect("reply");
    let IncomingBody::Stream(mut stream) = reply.data else {
        panic!("expected a reply stream");
    };
    let first = stream.next_chunk().await.expect("chunk").expect("value");
    assert_eq!(first, json!(1));
    stream.cancel("enough");

    settle().await;
    let producer = producer_handle.lock().clone().expect("producer stashed");
    assert_eq!(producer.status(), transom_core::StreamStatus::Cancelled);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_ping_peer_reaches_a_client() {
    let (parent, frame) = window_pair();
    let server = Server::bind(&frame, ServerOptions::default());
    let client = quick_client(&parent, &frame);

    assert!(
        server
            .ping_peer(&parent, "*", Duration::from_millis(500), None)
            .await
    );

    client.destroy();
    // With the client gone, the probe times out.
    assert!(
        !server
            .ping_peer(&parent, "*", Duration::from_millis(200), None)
            .await
    );
    server.destroy();
}
