use std::time::{Duration, Instant};

use ferry::{CopyFence, DmaEngine, IterDesc, PortDesc, XferDesc};

fn wait_fence(fence: &CopyFence) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !fence.has_completed() {
        assert!(Instant::now() < deadline, "copy timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// bits 31..8 count, bit 7 end-of-stream, bits 6..0 target port + 1
fn control_word(count: u32, port: Option<u32>, eos: bool) -> [u8; 4] {
    let word = (count << 8) | port.map_or(0, |p| p + 1) | if eos { 0x80 } else { 0 };
    word.to_le_bytes()
}

fn control_stream(engine: &DmaEngine, words: &[[u8; 4]]) -> (ferry::MemoryId, usize) {
    let bytes: Vec<u8> = words.iter().flatten().copied().collect();
    let mem = engine.register_system_memory(bytes.len());
    engine.write_memory(mem, 0, &bytes);
    (mem, bytes.len())
}

#[test]
fn gather_three_sources_into_one_destination() {
    let engine = DmaEngine::start(Default::default());

    let srcs: Vec<_> = [100usize, 200, 50]
        .iter()
        .enumerate()
        .map(|(i, &n)| {
            let mem = engine.register_system_memory(n);
            let data: Vec<u8> = (0..n).map(|b| (b as u8) ^ (i as u8 * 0x40)).collect();
            engine.write_memory(mem, 0, &data);
            (mem, n, data)
        })
        .collect();
    let dst = engine.register_system_memory(350);

    let (ctl_src, ctl_len) = control_stream(
        &engine,
        &[
            control_word(100, Some(0), false),
            control_word(200, Some(1), false),
            control_word(50, Some(2), true),
        ],
    );
    let ctl_ib = engine.register_system_memory(64);

    // the control stream reaches the gather XD through an IB, like any other
    // producer/consumer edge
    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(ctl_src, IterDesc::span(0, ctl_len))],
            vec![PortDesc::ib(ctl_ib, 0, 64).with_peer(1, 3)],
        ),
        XferDesc::memcpy(
            vec![
                PortDesc::direct(srcs[0].0, IterDesc::span(0, srcs[0].1)),
                PortDesc::direct(srcs[1].0, IterDesc::span(0, srcs[1].1)),
                PortDesc::direct(srcs[2].0, IterDesc::span(0, srcs[2].1)),
                PortDesc::ib(ctl_ib, 0, 64).with_peer(0, 0).gather_control(),
            ],
            vec![PortDesc::direct(dst, IterDesc::span(0, 350))],
        ),
    ]);
    wait_fence(&fence);

    let mut out = vec![0u8; 350];
    engine.read_memory(dst, 0, &mut out);
    assert_eq!(&out[0..100], &srcs[0].2[..]);
    assert_eq!(&out[100..300], &srcs[1].2[..]);
    assert_eq!(&out[300..350], &srcs[2].2[..]);
    engine.shutdown();
}

#[test]
fn gather_with_no_port_skip() {
    let engine = DmaEngine::start(Default::default());

    let src = engine.register_system_memory(70);
    let data: Vec<u8> = (0..70).map(|b| b as u8 | 0x80).collect();
    engine.write_memory(src, 0, &data);
    let dst = engine.register_system_memory(100);

    // a "no target" control word skips destination bytes, leaving a hole
    let (ctl_src, ctl_len) = control_stream(
        &engine,
        &[
            control_word(50, Some(0), false),
            control_word(30, None, false),
            control_word(20, Some(0), true),
        ],
    );
    let ctl_ib = engine.register_system_memory(64);

    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(ctl_src, IterDesc::span(0, ctl_len))],
            vec![PortDesc::ib(ctl_ib, 0, 64).with_peer(1, 1)],
        ),
        XferDesc::memcpy(
            vec![
                PortDesc::direct(src, IterDesc::span(0, 70)),
                PortDesc::ib(ctl_ib, 0, 64).with_peer(0, 0).gather_control(),
            ],
            vec![PortDesc::direct(dst, IterDesc::span(0, 100))],
        ),
    ]);
    wait_fence(&fence);

    let mut out = vec![0u8; 100];
    engine.read_memory(dst, 0, &mut out);
    assert_eq!(&out[0..50], &data[0..50]);
    assert!(out[50..80].iter().all(|b| *b == 0), "skipped bytes written");
    assert_eq!(&out[80..100], &data[50..70]);
    engine.shutdown();
}

#[test]
fn scatter_one_source_into_two_destinations() {
    let engine = DmaEngine::start(Default::default());

    let src = engine.register_system_memory(300);
    let data: Vec<u8> = (0..300).map(|b| (b % 251) as u8).collect();
    engine.write_memory(src, 0, &data);
    let dst0 = engine.register_system_memory(100);
    let dst1 = engine.register_system_memory(200);

    let (ctl_src, ctl_len) = control_stream(
        &engine,
        &[
            control_word(100, Some(0), false),
            control_word(200, Some(1), true),
        ],
    );
    let ctl_ib = engine.register_system_memory(64);

    // scatter control is carried in-band: it is an *input* port of the
    // scattering XD
    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(ctl_src, IterDesc::span(0, ctl_len))],
            vec![PortDesc::ib(ctl_ib, 0, 64).with_peer(1, 1)],
        ),
        XferDesc::memcpy(
            vec![
                PortDesc::direct(src, IterDesc::span(0, 300)),
                PortDesc::ib(ctl_ib, 0, 64).with_peer(0, 0).scatter_control(),
            ],
            vec![
                PortDesc::direct(dst0, IterDesc::span(0, 100)),
                PortDesc::direct(dst1, IterDesc::span(0, 200)),
            ],
        ),
    ]);
    wait_fence(&fence);

    let mut out0 = vec![0u8; 100];
    engine.read_memory(dst0, 0, &mut out0);
    let mut out1 = vec![0u8; 200];
    engine.read_memory(dst1, 0, &mut out1);
    assert_eq!(&out0[..], &data[0..100]);
    assert_eq!(&out1[..], &data[100..300]);
    engine.shutdown();
}
