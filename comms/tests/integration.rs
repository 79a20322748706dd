use comms::{
    Decode, Encode,
    msg::{Command, Msg, Payload},
    specs::server::ShardStatus,
};
use tokio::io;

struct MyStr<'a>(&'a str);

impl<'a> Encode<'a> for MyStr<'_> {
    fn encode(&'a self, _buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        Some(self.0.as_bytes())
    }
}

impl<'a> Decode<'a> for MyStr<'a> {
    fn decode(buf: &'a mut [u8]) -> std::io::Result<Self> {
        let s = std::str::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self(s))
    }
}

#[tokio::test]
async fn send_recv() {
    const SIZE: usize = 128;

    let msg = MyStr("Hello, world!");

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    tx.send(&msg).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let s: MyStr = rx.recv_into(&mut buf).await.unwrap();

    assert_eq!(msg.0, s.0);
}

#[tokio::test]
async fn control_then_data_over_one_stream() {
    let (one, two) = io::duplex(4096);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (peer_rx, peer_tx) = io::split(two);
    let (mut rx, _) = comms::channel(peer_rx, peer_tx);

    let status = ShardStatus {
        shard: 0,
        initialized: true,
        global_step: Some(42),
    };
    let params = [0.5f32, 1.5, -3.0];

    tx.send(&Msg::Control(Command::Ready(status))).await.unwrap();
    tx.send(&Msg::Data(Payload::Gradient(&params))).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Ready(got)) => assert_eq!(got, status),
        other => panic!("unexpected message {other:?}"),
    }

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Gradient(got)) => assert_eq!(got, params),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn frames_over_the_limit_are_refused() {
    let (one, two) = io::duplex(1024);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (peer_rx, peer_tx) = io::split(two);
    let (rx, _) = comms::channel(peer_rx, peer_tx);
    let mut rx = rx.with_max_len(8);

    tx.send(&MyStr("this frame is too long")).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<MyStr, _>(&mut buf).await.err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn a_closed_peer_aborts_the_connection() {
    let (one, two) = io::duplex(64);
    drop(one);

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u64> = Vec::new();
    let err = rx.recv_into::<MyStr, _>(&mut buf).await.err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
}
