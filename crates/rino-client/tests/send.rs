//! Sender client against a plain TCP listener standing in for a link.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use rino_client::{send_message, ClientError, SendOptions};
use rino_protocol::{parse, Message};

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_sends_one_encoded_message() {
    let (listener, port) = listener().await;
    let receiver = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    });

    let message = Message::new("alice", "build finished");
    let written = send_message(&SendOptions::new(port), &message)
        .await
        .unwrap();

    let received = receiver.await.unwrap();
    assert_eq!(received, b"alice|x|build finished\n");
    assert_eq!(written, received.len());
    assert_eq!(parse(&received), message);
}

#[tokio::test]
async fn test_custom_delimiter() {
    let (listener, port) = listener().await;
    let receiver = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    });

    let options = SendOptions::new(port).delimiter("|!|");
    send_message(&options, &Message::new("bob@#rust", "ping"))
        .await
        .unwrap();
    assert_eq!(receiver.await.unwrap(), b"bob@#rust|!|ping\n");
}

#[tokio::test]
async fn test_refused_connection() {
    let (listener, port) = listener().await;
    drop(listener);

    let options = SendOptions::new(port).timeout(Duration::from_secs(1));
    let result = send_message(&options, &Message::new("root", "hello")).await;
    assert!(matches!(result, Err(ClientError::Connect { .. })));
}
