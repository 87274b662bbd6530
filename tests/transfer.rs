use std::time::{Duration, Instant};

use rand::prelude::*;

use ferry::{CopyFence, DmaEngine, IterDesc, MemoryId, PortDesc, XferDesKind, XferDesc};

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

fn read_back(engine: &DmaEngine, mem: MemoryId, n: usize) -> Vec<u8> {
    let mut v = vec![0u8; n];
    engine.read_memory(mem, 0, &mut v);
    v
}

#[test]
fn memcpy_1mib_contiguous() {
    let engine = DmaEngine::start(Default::default());
    let n = 1 << 20;
    let src = engine.register_system_memory(n);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(n, 1);
    engine.write_memory(src, 0, &data);

    let fence = engine.submit(XferDesc::memcpy(
        vec![PortDesc::direct(src, IterDesc::span(0, n))],
        vec![PortDesc::direct(dst, IterDesc::span(0, n))],
    ));
    wait_fence(&fence);
    assert!(fence.succeeded());

    assert_eq!(read_back(&engine, dst, n), data);
    engine.shutdown();
}

#[test]
fn memcpy_subrange_with_offsets() {
    let engine = DmaEngine::start(Default::default());
    let src = engine.register_system_memory(4096);
    let dst = engine.register_system_memory(4096);
    let data = seed_bytes(4096, 2);
    engine.write_memory(src, 0, &data);

    // copy 1000 bytes from offset 17 to offset 33
    let fence = engine.submit(XferDesc::memcpy(
        vec![PortDesc::direct(src, IterDesc::span(17, 1000))],
        vec![PortDesc::direct(dst, IterDesc::span(33, 1000))],
    ));
    wait_fence(&fence);

    let out = read_back(&engine, dst, 4096);
    assert_eq!(&out[33..1033], &data[17..1017]);
    assert!(out[..33].iter().all(|b| *b == 0));
    assert!(out[1033..].iter().all(|b| *b == 0));
    engine.shutdown();
}

#[test]
fn memcpy_strided_rectangles() {
    let engine = DmaEngine::start(Default::default());
    let src = engine.register_system_memory(64 * 256);
    let dst = engine.register_system_memory(64 * 128);
    let data = seed_bytes(64 * 256, 3);
    engine.write_memory(src, 0, &data);

    // a 64x64 tile: source lines stride 256, destination packs them at 128
    let fence = engine.submit(XferDesc::memcpy(
        vec![PortDesc::direct(
            src,
            IterDesc::affine(0, vec![(64, 0), (64, 256)]),
        )],
        vec![PortDesc::direct(
            dst,
            IterDesc::affine(0, vec![(64, 0), (64, 128)]),
        )],
    ));
    wait_fence(&fence);

    let out = read_back(&engine, dst, 64 * 128);
    for line in 0..64 {
        assert_eq!(
            &out[line * 128..line * 128 + 64],
            &data[line * 256..line * 256 + 64],
            "line {}",
            line
        );
    }
    engine.shutdown();
}

#[test]
fn memcpy_3d_rectangles() {
    let engine = DmaEngine::start(Default::default());
    let n = 4 * 8 * 16;
    let src = engine.register_system_memory(16 * 64 * 8);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(16 * 64 * 8, 4);
    engine.write_memory(src, 0, &data);

    // 4 planes of 8 lines of 16 bytes, packed tight on the way out
    let fence = engine.submit(XferDesc::memcpy(
        vec![PortDesc::direct(
            src,
            IterDesc::affine(0, vec![(16, 0), (8, 64), (4, 1024)]),
        )],
        vec![PortDesc::direct(
            dst,
            IterDesc::affine(0, vec![(16, 0), (8, 16), (4, 128)]),
        )],
    ));
    wait_fence(&fence);

    let out = read_back(&engine, dst, n);
    for plane in 0..4 {
        for line in 0..8 {
            let src_off = plane * 1024 + line * 64;
            let dst_off = plane * 128 + line * 16;
            assert_eq!(
                &out[dst_off..dst_off + 16],
                &data[src_off..src_off + 16],
                "plane {} line {}",
                plane,
                line
            );
        }
    }
    engine.shutdown();
}

#[test]
fn ib_chained_memcpy_16mib_through_64kib_window() {
    let engine = DmaEngine::start(Default::default());
    let n = 16 << 20;
    let ib_size = 64 << 10;
    let src = engine.register_system_memory(n);
    let ib = engine.register_system_memory(ib_size);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(n, 5);
    engine.write_memory(src, 0, &data);

    // producer fills the window, consumer drains it; flow control keeps the
    // producer at most one window ahead
    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(src, IterDesc::span(0, n))],
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(0, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        ),
    ]);
    wait_fence(&fence);

    assert_eq!(read_back(&engine, dst, n), data);
    engine.shutdown();
}

#[test]
fn ib_chain_of_three_stages() {
    let engine = DmaEngine::start(Default::default());
    let n = 1 << 20;
    let src = engine.register_system_memory(n);
    let ib_a = engine.register_system_memory(16 << 10);
    let ib_b = engine.register_system_memory(8 << 10);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(n, 6);
    engine.write_memory(src, 0, &data);

    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(src, IterDesc::span(0, n))],
            vec![PortDesc::ib(ib_a, 0, 16 << 10).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib_a, 0, 16 << 10).with_peer(0, 0)],
            vec![PortDesc::ib(ib_b, 0, 8 << 10).with_peer(2, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib_b, 0, 8 << 10).with_peer(1, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        ),
    ]);
    wait_fence(&fence);

    assert_eq!(read_back(&engine, dst, n), data);
    engine.shutdown();
}

#[test]
fn disk_round_trip() {
    let engine = DmaEngine::start(Default::default());
    let n = 1 << 20;
    let path = std::env::temp_dir().join(format!("ferry-disk-{}", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    file.set_len(n as u64).unwrap();

    let disk = engine.register_disk_memory(file, n);
    let src = engine.register_system_memory(n);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(n, 7);
    engine.write_memory(src, 0, &data);

    let fence = engine.submit(XferDesc::with_kind(
        XferDesKind::DiskWrite,
        vec![PortDesc::direct(src, IterDesc::span(0, n))],
        vec![PortDesc::direct(disk, IterDesc::span(0, n))],
    ));
    wait_fence(&fence);

    let fence = engine.submit(XferDesc::with_kind(
        XferDesKind::DiskRead,
        vec![PortDesc::direct(disk, IterDesc::span(0, n))],
        vec![PortDesc::direct(dst, IterDesc::span(0, n))],
    ));
    wait_fence(&fence);
    assert!(fence.succeeded());

    assert_eq!(read_back(&engine, dst, n), data);
    engine.shutdown();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn disk_read_error_surfaces_on_the_fence() {
    let engine = DmaEngine::start(Default::default());
    let n = 4096;
    let path = std::env::temp_dir().join(format!("ferry-short-{}", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    // the file is shorter than the registered window, so the read hits EOF
    file.set_len(512).unwrap();

    let disk = engine.register_disk_memory(file, n);
    let dst = engine.register_system_memory(n);

    let fence = engine.submit(XferDesc::with_kind(
        XferDesKind::DiskRead,
        vec![PortDesc::direct(disk, IterDesc::span(0, n))],
        vec![PortDesc::direct(dst, IterDesc::span(0, n))],
    ));
    wait_fence(&fence);
    assert!(!fence.succeeded());

    engine.shutdown();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn global_segment_round_trip() {
    let engine = DmaEngine::start(Default::default());
    let n = 256 << 10;
    let seg = engine.register_global_memory(n);
    let src = engine.register_system_memory(n);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(n, 8);
    engine.write_memory(src, 0, &data);

    let fence = engine.submit(XferDesc::auto(
        vec![PortDesc::direct(src, IterDesc::span(0, n))],
        vec![PortDesc::direct(seg, IterDesc::span(0, n))],
    ));
    wait_fence(&fence);

    let fence = engine.submit(XferDesc::auto(
        vec![PortDesc::direct(seg, IterDesc::span(0, n))],
        vec![PortDesc::direct(dst, IterDesc::span(0, n))],
    ));
    wait_fence(&fence);

    assert_eq!(read_back(&engine, dst, n), data);
    engine.shutdown();
}

#[test]
fn path_queries_pick_the_right_channel() {
    let engine = DmaEngine::start(Default::default());
    let sys = engine.register_system_memory(4096);
    let sys2 = engine.register_system_memory(4096);
    let seg = engine.register_global_memory(4096);
    let path = std::env::temp_dir().join(format!("ferry-path-{}", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    file.set_len(4096).unwrap();
    let disk = engine.register_disk_memory(file, 4096);

    assert_eq!(
        engine.query_path(sys, sys2, 0, 0).map(|m| m.0),
        Some(XferDesKind::MemCpy)
    );
    assert_eq!(
        engine.query_path(disk, sys, 0, 0).map(|m| m.0),
        Some(XferDesKind::DiskRead)
    );
    assert_eq!(
        engine.query_path(sys, disk, 0, 0).map(|m| m.0),
        Some(XferDesKind::DiskWrite)
    );
    assert_eq!(
        engine.query_path(seg, sys, 0, 0).map(|m| m.0),
        Some(XferDesKind::GlobalRead)
    );
    assert_eq!(
        engine.query_path(sys, seg, 0, 0).map(|m| m.0),
        Some(XferDesKind::GlobalWrite)
    );
    // no channel serializes into the disk path
    assert_eq!(engine.query_path(sys, disk, 1, 0), None);

    engine.shutdown();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn deferred_enqueue_waits_for_metadata() {
    let engine = DmaEngine::start(Default::default());
    let n = 256 << 10;
    let ib_size = 16 << 10;
    let src = engine.register_system_memory(n);
    let ib = engine.register_system_memory(ib_size);
    let dst = engine.register_system_memory(n);
    let data = seed_bytes(n, 9);
    engine.write_memory(src, 0, &data);

    // the consumer's metadata isn't ready: the producer runs ahead and its
    // byte updates must be buffered until the consumer registers
    let metadata = ferry::Event::new();
    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(src, IterDesc::span(0, n))],
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(0, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n))],
        )
        .with_metadata_event(metadata.clone()),
    ]);

    std::thread::sleep(Duration::from_millis(50));
    assert!(!fence.has_completed());

    metadata.trigger();
    wait_fence(&fence);

    assert_eq!(read_back(&engine, dst, n), data);
    engine.shutdown();
}
