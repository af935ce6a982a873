//! End-to-end tests over the framed stream transport.
//!
//! A small scripted worker listens on `127.0.0.1:0` and answers requests
//! the way a real toplevel worker would, including incremental output.

use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use toplevel_core::channel::stream::{read_frame, write_frame};
use toplevel_core::{
    ClientError, EnvAck, EvalOutput, InboundMessage, InitConfig, OutboundMessage, OutputAt,
    StreamChannel, WorkerClient,
};

async fn reply<W>(writer: &mut W, message: &InboundMessage)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message).unwrap();
    write_frame(writer, &payload).await.unwrap();
}

/// Spawn a worker that echoes each phrase of an evaluation back as
/// incremental output and leaves the terminal output empty.
async fn spawn_worker() -> (std::net::SocketAddr, JoinHandle<Vec<OutboundMessage>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let mut received = Vec::new();

        while let Some(frame) = read_frame(&mut reader).await.unwrap() {
            let message: OutboundMessage = serde_json::from_slice(&frame).unwrap();
            match &message {
                OutboundMessage::Init { .. } => {
                    reply(&mut writer, &InboundMessage::Ready { message: None }).await;
                }
                OutboundMessage::Eval { cell_id, code, .. } => {
                    for phrase in code.split_inclusive(";;") {
                        let fragment = InboundMessage::OutputAt(OutputAt {
                            cell_id: *cell_id,
                            caml_ppf: format!("[{}]", phrase.trim()),
                            ..Default::default()
                        });
                        reply(&mut writer, &fragment).await;
                    }
                    let terminal = InboundMessage::Output(EvalOutput {
                        cell_id: *cell_id,
                        ..Default::default()
                    });
                    reply(&mut writer, &terminal).await;
                }
                OutboundMessage::CreateEnv { env_id } => {
                    let ack = InboundMessage::EnvCreated(EnvAck {
                        env_id: env_id.clone(),
                    });
                    reply(&mut writer, &ack).await;
                }
                OutboundMessage::Errors { cell_id, .. } => {
                    let failure = InboundMessage::EvalError {
                        cell_id: *cell_id,
                        message: "unsupported".into(),
                    };
                    reply(&mut writer, &failure).await;
                }
                _ => {}
            }
            received.push(message);
        }

        received
    });

    (addr, handle)
}

#[tokio::test]
async fn test_tcp_session_end_to_end() {
    let (addr, worker) = spawn_worker().await;
    let fragments = Arc::new(Mutex::new(Vec::new()));

    let channel = StreamChannel::connect_tcp(addr).await.unwrap();
    let client = WorkerClient::builder(channel)
        .on_output_at({
            let fragments = fragments.clone();
            move |out| fragments.lock().unwrap().push(out.caml_ppf.clone())
        })
        .build()
        .unwrap();

    client
        .initialize(InitConfig::new().require("fmt"))
        .await
        .unwrap();
    assert!(client.ready_state().is_ready());

    let ack = client.create_environment("scratch").await.unwrap();
    assert_eq!(ack.env_id, "scratch");

    let output = client
        .evaluate("let x = 1;; x + 1;;", "scratch")
        .await
        .unwrap();
    assert_eq!(output.caml_ppf, "[let x = 1;;][x + 1;;]");
    assert_eq!(fragments.lock().unwrap().len(), 2);

    let errors = client.query_errors("x", "scratch").await;
    assert!(matches!(errors, Err(ClientError::Operation { .. })));

    client.terminate();

    // The worker sees end-of-stream once the client releases the channel.
    let received = worker.await.unwrap();
    assert_eq!(received.len(), 4);
    assert!(matches!(received[0], OutboundMessage::Init { .. }));
    assert!(matches!(
        &received[2],
        OutboundMessage::Eval { env_id, .. } if env_id == "scratch"
    ));
}

#[tokio::test]
async fn test_worker_disconnect_fails_pending_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let worker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = stream.split();
        // Read one request, then hang up without answering.
        read_frame(&mut reader).await.unwrap();
    });

    let channel = StreamChannel::connect_tcp(addr).await.unwrap();
    let client = WorkerClient::new(channel).unwrap();

    let result = client.evaluate("1", "").await;
    assert!(matches!(result, Err(ClientError::ChannelFailure { .. })));
    worker.await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_spawned_process_channel_round_trips_frames() {
    // `cat` echoes every frame back unchanged.
    let command = tokio::process::Command::new("cat");
    let channel = StreamChannel::spawn(command).unwrap();
    let (mut sender, mut receiver) = channel.into_parts();

    sender
        .send(r#"{"type":"ready"}"#.to_string())
        .await
        .unwrap();
    assert_eq!(
        receiver.recv().await.unwrap().unwrap(),
        r#"{"type":"ready"}"#
    );

    sender.close().await.unwrap();
    assert!(receiver.recv().await.is_none());
}

#[tokio::test]
async fn test_invalid_utf8_frame_leaves_pending_request_intact() {
    let (client_io, worker_io) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (mut worker_read, mut worker_write) = tokio::io::split(worker_io);

    let client = WorkerClient::new(StreamChannel::from_io(client_read, client_write)).unwrap();
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.evaluate("1", "").await }
    });

    let frame = read_frame(&mut worker_read).await.unwrap().unwrap();
    let sent: OutboundMessage = serde_json::from_slice(&frame).unwrap();
    let cell_id = match sent {
        OutboundMessage::Eval { cell_id, .. } => cell_id,
        other => panic!("Expected Eval, got: {:?}", other),
    };

    write_frame(&mut worker_write, &[0xff, 0xfe, 0x00]).await.unwrap();
    let answer = InboundMessage::Output(EvalOutput {
        cell_id,
        caml_ppf: "- : int = 1".into(),
        ..Default::default()
    });
    reply(&mut worker_write, &answer).await;

    assert_eq!(task.await.unwrap().unwrap().caml_ppf, "- : int = 1");
    client.terminate();
}
