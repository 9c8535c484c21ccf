use super::{channel_pair, sample_register};
use crate::transport::TransportEvent;
use tokio::sync::mpsc::unbounded_channel;

#[tokio::test]
async fn test_channel_pair_delivers_messages() -> crate::Result<()> {
    let (a, b) = channel_pair("a.example.com:5060", "b.example.com:5060");

    let (sender, mut receiver) = unbounded_channel();
    let serve_b = b.clone();
    tokio::spawn(async move { serve_b.serve_loop(sender).await });

    a.send(sample_register().into()).await?;

    match receiver.recv().await {
        Some(TransportEvent::Incoming(msg, _, source)) => {
            assert!(matches!(msg, rsip::SipMessage::Request(_)));
            assert_eq!(source.addr.to_string(), "a.example.com:5060");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_channel_close_ends_serve_loop() -> crate::Result<()> {
    let (a, b) = channel_pair("a.example.com:5060", "b.example.com:5060");

    let (sender, _receiver) = unbounded_channel();
    let serve_b = b.clone();
    let handle = tokio::spawn(async move { serve_b.serve_loop(sender).await });

    b.close().await?;
    handle.await.expect("serve loop join").expect("serve loop result");
    drop(a);
    Ok(())
}
