use std::time::{Duration, Instant};

use rand::prelude::*;

use ferry::{CopyFence, DmaEngine, IterDesc, MemoryKind, PortDesc, XferDesc};

fn wait_fence(fence: &CopyFence) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !fence.has_completed() {
        assert!(Instant::now() < deadline, "copy timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn seed_bytes(n: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut v = vec![0u8; n];
    rng.fill_bytes(&mut v);
    v
}

#[test]
fn remote_node_runs_a_local_copy() {
    let engines = DmaEngine::start_mesh(2, Default::default());
    let (e0, e1) = (&engines[0], &engines[1]);

    let n = 64 << 10;
    let src = e1.register_system_memory(n);
    let dst = e1.register_system_memory(n);
    let data = seed_bytes(n, 21);
    e1.write_memory(src, 0, &data);

    // node 0 launches, node 1 executes; completion crosses back by message
    let fence = e0.submit(
        XferDesc::memcpy(
            vec![PortDesc::direct(src, IterDesc::span(0, n))],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        )
        .on_node(1),
    );
    wait_fence(&fence);

    let mut out = vec![0u8; n];
    e1.read_memory(dst, 0, &mut out);
    assert_eq!(out, data);

    for e in &engines {
        e.shutdown();
    }
}

#[test]
fn remote_write_single_message() {
    let engines = DmaEngine::start_mesh(2, Default::default());
    let (e0, e1) = (&engines[0], &engines[1]);

    let n = 4096;
    let ib_size = 64 << 10;
    let src = e0.register_memory(MemoryKind::Registered, n);
    let ib = e1.register_memory(MemoryKind::Registered, ib_size);
    let dst = e1.register_system_memory(n);
    e0.attach_remote_memory(e1, ib);

    let data = seed_bytes(n, 22);
    e0.write_memory(src, 0, &data);

    // the rdma path query on node 0 must pick the remote write channel
    assert_eq!(
        e0.query_path(src, ib, 0, 0).map(|m| m.0),
        Some(ferry::XferDesKind::RemoteWrite)
    );

    let fence = e0.submit_graph(vec![
        XferDesc::auto(
            vec![PortDesc::direct(src, IterDesc::span(0, n))],
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(0, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        )
        .on_node(1),
    ]);
    wait_fence(&fence);

    let mut out = vec![0u8; n];
    e1.read_memory(dst, 0, &mut out);
    assert_eq!(out, data);

    for e in &engines {
        e.shutdown();
    }
}

#[test]
fn remote_write_streams_through_small_window() {
    let engines = DmaEngine::start_mesh(2, Default::default());
    let (e0, e1) = (&engines[0], &engines[1]);

    let n = 1 << 20;
    let ib_size = 64 << 10;
    let src = e0.register_memory(MemoryKind::Registered, n);
    let ib = e1.register_memory(MemoryKind::Registered, ib_size);
    let dst = e1.register_system_memory(n);
    e0.attach_remote_memory(e1, ib);

    let data = seed_bytes(n, 23);
    e0.write_memory(src, 0, &data);

    // many payload messages; the consumer's space updates flow back across
    // the mesh to keep the producer inside the window
    let fence = e0.submit_graph(vec![
        XferDesc::remote_write(
            vec![PortDesc::direct(src, IterDesc::span(0, n))],
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(0, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        )
        .on_node(1),
    ]);
    wait_fence(&fence);

    let mut out = vec![0u8; n];
    e1.read_memory(dst, 0, &mut out);
    assert_eq!(out, data);

    for e in &engines {
        e.shutdown();
    }
}

#[test]
fn remote_write_strided_source_lines() {
    let engines = DmaEngine::start_mesh(2, Default::default());
    let (e0, e1) = (&engines[0], &engines[1]);

    let lines = 64;
    let line_bytes = 256;
    let stride = 1024;
    let n = lines * line_bytes;
    let ib_size = 64 << 10;
    let src = e0.register_memory(MemoryKind::Registered, lines * stride);
    let ib = e1.register_memory(MemoryKind::Registered, ib_size);
    let dst = e1.register_system_memory(n);
    e0.attach_remote_memory(e1, ib);

    let data = seed_bytes(lines * stride, 24);
    e0.write_memory(src, 0, &data);

    let fence = e0.submit_graph(vec![
        XferDesc::remote_write(
            vec![PortDesc::direct(
                src,
                IterDesc::affine(0, vec![(line_bytes, 0), (lines, stride)]),
            )],
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(0, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        )
        .on_node(1),
    ]);
    wait_fence(&fence);

    let mut out = vec![0u8; n];
    e1.read_memory(dst, 0, &mut out);
    for line in 0..lines {
        assert_eq!(
            &out[line * line_bytes..(line + 1) * line_bytes],
            &data[line * stride..line * stride + line_bytes],
            "line {}",
            line
        );
    }

    for e in &engines {
        e.shutdown();
    }
}
