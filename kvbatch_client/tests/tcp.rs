use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use kvbatch_client::{
    Bin, Client, ErrorKind, Key, NodeRef, Policy, StaticPartitionMap, Value, WritePolicy,
    codec::{self, HEADER_SIZE, ProtocolError},
    connection::{ConnectionProvider, DEFAULT_MAX_FRAME_SIZE, TcpConnectionProvider},
    testing::MockCluster,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Serve `cluster` as node `node` on a local port.
async fn spawn_node(cluster: MockCluster, name: &str) -> (NodeRef, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node = NodeRef::new(name, listener.local_addr().unwrap().to_string());
    let accepted = Arc::new(AtomicUsize::new(0));

    let served = node.clone();
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(stream, cluster.clone(), served.clone()));
        }
    });

    (node, accepted)
}

/// Read one request frame off `stream`.
async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut header = [0; HEADER_SIZE];
    stream.read_exact(&mut header).await.ok()?;
    let (_, len) = codec::decode_header(header).unwrap();
    let mut frame = header.to_vec();
    frame.resize(HEADER_SIZE + len as usize, 0);
    stream.read_exact(&mut frame[HEADER_SIZE..]).await.ok()?;
    Some(Bytes::from(frame))
}

async fn serve(mut stream: TcpStream, cluster: MockCluster, node: NodeRef) {
    while let Some(frame) = read_frame(&mut stream).await {
        for response in cluster.respond(&node, frame).unwrap() {
            stream.write_all(&response).await.unwrap();
        }
    }
}

fn policy() -> Policy {
    Policy {
        timeout: Some(Duration::from_secs(5)),
        sleep_between_retries: Duration::from_millis(10),
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn batch_over_tcp() {
    let cluster = MockCluster::new();
    cluster.set_rows_per_frame(3);
    let (node, accepted) = spawn_node(cluster.clone(), "local").await;

    let provider = Arc::new(TcpConnectionProvider::new(4, Duration::from_secs(1)));
    let map = StaticPartitionMap::new().with_namespace("test", &[node.clone()]);
    let client = Client::new(
        Arc::new(map),
        Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
    );

    let keys = (1..=10)
        .map(|i| Key::new("test", "demo", format!("batchkey{i}")))
        .collect::<Vec<_>>();
    let write = WritePolicy {
        policy: policy(),
        expiration: 0,
    };
    for (i, key) in keys.iter().enumerate().take(8) {
        client
            .put(&write, key, vec![Bin::new("batchbin", format!("batchvalue{}", i + 1))])
            .await
            .unwrap();
    }

    let records = client.get_many(&policy(), keys.clone(), &[]).await.unwrap();
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate().take(8) {
        let record = record.as_ref().unwrap();
        assert_eq!(
            record.get("batchbin"),
            Some(&Value::from(format!("batchvalue{}", i + 1)))
        );
    }
    assert!(records[8].is_none());
    assert!(records[9].is_none());

    let exists = client.exists_many(&policy(), keys).await.unwrap();
    assert_eq!(exists.iter().filter(|e| **e).count(), 8);

    // every exchange was read to the end, so one connection served them all
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(provider.idle_connections(&node), 1);
}

#[tokio::test]
async fn unreachable_node_exhausts_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let node = NodeRef::new("gone", address);
    let map = StaticPartitionMap::new().with_namespace("test", &[node]);
    let client = Client::new(Arc::new(map), Arc::new(TcpConnectionProvider::default()));

    let key = Key::new("test", "demo", "putgetkey");
    let err = client.get(&policy(), &key, &[]).await.unwrap_err();
    assert!(
        matches!(err, kvbatch_client::Error::RetriesExhausted { attempts: 3, .. }),
        "{err}"
    );
}

#[test_log::test(tokio::test)]
async fn oversized_frame_fails_the_leg() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node = NodeRef::new("liar", listener.local_addr().unwrap().to_string());
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_frame(&mut stream).await.unwrap();

        // response header announcing a 128 TiB body
        let header = (u64::from(codec::PROTO_VERSION) << 56) | (3 << 48) | (1 << 47);
        stream.write_all(&header.to_be_bytes()).await.unwrap();

        // keep the connection open until the client hangs up
        let mut rest = vec![];
        let _ = stream.read_to_end(&mut rest).await;
    });

    let provider = Arc::new(
        TcpConnectionProvider::new(4, Duration::from_secs(1))
            .with_max_frame_size(DEFAULT_MAX_FRAME_SIZE),
    );
    let map = StaticPartitionMap::new().with_namespace("test", &[node.clone()]);
    let client = Client::new(
        Arc::new(map),
        Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
    );

    let policy = Policy {
        timeout: Some(Duration::from_secs(2)),
        max_retries: 0,
        ..Default::default()
    };
    let keys = vec![Key::new("test", "demo", "batchkey1")];
    let err = client.get_many(&policy, keys, &[]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolError, "{err}");
    assert!(
        matches!(
            &err,
            kvbatch_client::Error::Protocol {
                source: ProtocolError::TooLong { len, .. },
                ..
            } if *len == 1 << 47
        ),
        "{err}"
    );
    // a connection with unread bytes is never pooled
    assert_eq!(provider.idle_connections(&node), 0);
}
