use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::prelude::*;

use ferry::{CopyFence, CustomSerdez, DmaEngine, IterDesc, PortDesc, XferDesc};

fn wait_fence(fence: &CopyFence) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !fence.has_completed() {
        assert!(Instant::now() < deadline, "copy timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Variable-length u64 codec: a length byte followed by the value with
/// trailing zero bytes stripped.  Worst case is padded way up so the engine's
/// conservative space accounting gets a workout.
struct VarIntSerdez;

const FIELD: usize = 8;
const MAX_SER: usize = 32;

impl VarIntSerdez {
    unsafe fn encode_one(src: *const u8, dst: *mut u8) -> usize {
        let value = u64::from_le_bytes(std::slice::from_raw_parts(src, FIELD).try_into().unwrap());
        let len = (8 - (value.leading_zeros() / 8) as usize).max(1);
        *dst = len as u8;
        std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), dst.add(1), len);
        1 + len
    }

    unsafe fn decode_one(dst: *mut u8, src: *const u8) -> usize {
        let len = *src as usize;
        assert!((1..=8).contains(&len));
        let mut bytes = [0u8; 8];
        std::ptr::copy_nonoverlapping(src.add(1), bytes.as_mut_ptr(), len);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, FIELD);
        1 + len
    }
}

impl CustomSerdez for VarIntSerdez {
    fn sizeof_field_type(&self) -> usize {
        FIELD
    }
    fn max_serialized_size(&self) -> usize {
        MAX_SER
    }
    unsafe fn serialize(
        &self,
        src: *const u8,
        field_size: usize,
        count: usize,
        dst: *mut u8,
    ) -> usize {
        assert_eq!(field_size, FIELD);
        let mut used = 0;
        for i in 0..count {
            used += Self::encode_one(src.add(i * FIELD), dst.add(used));
        }
        used
    }
    unsafe fn serialize_one(&self, src: *const u8, dst: *mut u8) -> usize {
        Self::encode_one(src, dst)
    }
    unsafe fn deserialize(
        &self,
        dst: *mut u8,
        field_size: usize,
        count: usize,
        src: *const u8,
    ) -> usize {
        assert_eq!(field_size, FIELD);
        let mut used = 0;
        for i in 0..count {
            used += Self::decode_one(dst.add(i * FIELD), src.add(used));
        }
        used
    }
    unsafe fn deserialize_one(&self, dst: *mut u8, src: *const u8) -> usize {
        Self::decode_one(dst, src)
    }
}

fn random_values(count: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(count * FIELD);
    for _ in 0..count {
        // mixed magnitudes so encoded lengths vary
        let v: u64 = match rng.gen_range(0..3) {
            0 => rng.gen_range(0..256),
            1 => rng.gen_range(0..(1 << 32)),
            _ => rng.gen(),
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn serdez_round_trip(elems: usize, ib_size: usize, seed: u64) {
    let engine = DmaEngine::start(Default::default());
    engine.register_serdez(1, Arc::new(VarIntSerdez));

    let n = elems * FIELD;
    let src = engine.register_system_memory(n);
    let ib = engine.register_system_memory(ib_size);
    let dst = engine.register_system_memory(n);
    let data = random_values(elems, seed);
    engine.write_memory(src, 0, &data);

    // serialize into the window, deserialize on the far side; encoded sizes
    // are unknown ahead of time, so both XDs run the elastic paths
    let fence = engine.submit_graph(vec![
        XferDesc::memcpy(
            vec![PortDesc::direct(src, IterDesc::span(0, n)).with_serdez(1)],
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(1, 0)],
        ),
        XferDesc::memcpy(
            vec![PortDesc::ib(ib, 0, ib_size).with_peer(0, 0)],
            vec![PortDesc::direct(dst, IterDesc::span(0, n)).with_serdez(1)],
        ),
    ]);
    wait_fence(&fence);

    let mut out = vec![0u8; n];
    engine.read_memory(dst, 0, &mut out);
    assert_eq!(out, data);
    engine.shutdown();
}

#[test]
fn serialize_through_undersized_window() {
    // window holds at most 8 worst-case elements; encoded elements straddle
    // the wrap boundary constantly
    serdez_round_trip(1000, 256, 11);
}

#[test]
fn serialize_through_roomy_window() {
    serdez_round_trip(5000, 64 << 10, 12);
}

#[test]
fn serialize_single_element() {
    serdez_round_trip(1, 256, 13);
}
