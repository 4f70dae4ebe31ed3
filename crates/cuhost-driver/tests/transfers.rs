//! Integration test: host <-> device transfers and allocation accounting.
//!
//! Run with: cargo test -p cuhost-driver --test transfers -- --nocapture

mod common;

use std::any::Any;

use cuhost_driver::{AttachFlags, CuError, DeviceBuffer, DeviceScalar, Stream, StreamFlags};

const SIZES: [usize; 5] = [1, 3, 255, 256, 4097];

fn round_trip<T: DeviceScalar + PartialEq + std::fmt::Debug>(make: impl Fn(usize) -> T) {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    for &n in &SIZES {
        let host: Vec<T> = (0..n).map(&make).collect();
        let dev = DeviceBuffer::from_slice(&ctx, &host).unwrap();
        assert_eq!(dev.byte_len(), n * std::mem::size_of::<T>());
        assert_eq!(dev.to_vec().unwrap(), host, "size {}", n);
    }
}

#[test]
fn test_round_trip_every_scalar() {
    round_trip(|i| i as i32 - 100);
    round_trip(|i| (i as i64) << 40);
    round_trip(|i| i as u32 * 3);
    round_trip(|i| u64::MAX - i as u64);
    round_trip(|i| i as f32 * 0.5);
    round_trip(|i| i as f64 / 3.0);
    round_trip(|i| i as u8);
}

#[test]
fn test_any_dispatch_matches_typed_path() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let mut dev = DeviceBuffer::<f64>::alloc(&ctx, 4).unwrap();

    let src: Box<dyn Any> = Box::new(vec![1.5f64, -2.0, 0.0, 8.25]);
    dev.copy_from_any(src.as_ref()).unwrap();
    assert_eq!(dev.to_vec().unwrap(), vec![1.5, -2.0, 0.0, 8.25]);

    let mut out: Box<dyn Any> = Box::new(vec![0f64; 4]);
    dev.copy_to_any(out.as_mut()).unwrap();
    let out = out.downcast::<Vec<f64>>().unwrap();
    assert_eq!(*out, vec![1.5, -2.0, 0.0, 8.25]);
}

#[test]
fn test_any_dispatch_rejects_other_types() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let mut dev = DeviceBuffer::<u32>::alloc(&ctx, 2).unwrap();

    let strings: Vec<String> = vec!["a".into(), "b".into()];
    assert!(matches!(dev.copy_from_any(&strings), Err(CuError::UnsupportedHostType)));
    let slice: [u32; 2] = [1, 2];
    assert!(matches!(dev.copy_from_any(&slice), Err(CuError::UnsupportedHostType)));

    let wrong_len = vec![1u32, 2, 3];
    assert!(matches!(dev.copy_from_any(&wrong_len), Err(CuError::SizeMismatch { .. })));
}

#[test]
fn test_alloc_free_balance() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let (free_before, total) = ctx.memory_info().unwrap();

    let bufs: Vec<DeviceBuffer<'_, u64>> = SIZES
        .iter()
        .map(|&n| DeviceBuffer::alloc(&ctx, n).unwrap())
        .collect();
    let (free_during, _) = ctx.memory_info().unwrap();
    let bytes: usize = SIZES.iter().map(|n| n * 8).sum();
    println!("total {} free {} -> {} ({} requested)", total, free_before, free_during, bytes);
    assert!(free_before - free_during >= bytes);

    for buf in bufs {
        buf.free().unwrap();
    }
    assert_eq!(ctx.memory_info().unwrap().0, free_before);
    assert_eq!(emu.live_allocations(), 0);
}

#[test]
fn test_drop_releases_allocations() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    {
        let _a = DeviceBuffer::<i32>::alloc(&ctx, 16).unwrap();
        let _b = DeviceBuffer::<f32>::alloc(&ctx, 16).unwrap();
        assert_eq!(emu.live_allocations(), 2);
    }
    assert_eq!(emu.live_allocations(), 0);
}

#[test]
fn test_stream_ordering_matches_sync_copies() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let stream = Stream::new(&ctx, StreamFlags::NON_BLOCKING).unwrap();

    let first: Vec<u32> = (0..64).collect();
    let second: Vec<u32> = (0..64).map(|i| i * 10).collect();

    // Two writes to the same buffer: the later one must win.
    let mut dev = DeviceBuffer::<u32>::alloc(&ctx, 64).unwrap();
    let mut copy = DeviceBuffer::<u32>::alloc(&ctx, 64).unwrap();
    let mut out = vec![0u32; 64];
    unsafe {
        dev.copy_from_host_async(&first, &stream).unwrap();
        copy.copy_from_device_async(&dev, &stream).unwrap();
        dev.copy_from_host_async(&second, &stream).unwrap();
        dev.copy_to_host_async(&mut out, &stream).unwrap();
    }
    stream.synchronize().unwrap();
    assert_eq!(out, second);
    assert_eq!(copy.to_vec().unwrap(), first);

    // Same sequence, synchronously.
    let mut dev_sync = DeviceBuffer::<u32>::alloc(&ctx, 64).unwrap();
    let mut copy_sync = DeviceBuffer::<u32>::alloc(&ctx, 64).unwrap();
    dev_sync.copy_from_host(&first).unwrap();
    copy_sync.copy_from_device(&dev_sync).unwrap();
    dev_sync.copy_from_host(&second).unwrap();
    assert_eq!(dev_sync.to_vec().unwrap(), out);
    assert_eq!(copy_sync.to_vec().unwrap(), copy.to_vec().unwrap());
}

#[test]
fn test_managed_allocation() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let mut buf = DeviceBuffer::<i64>::alloc_managed(&ctx, 8, AttachFlags::GLOBAL).unwrap();
    assert!(emu.is_managed(buf.device_ptr().as_raw()));
    buf.copy_from_host(&[9; 8]).unwrap();
    assert_eq!(buf.to_vec().unwrap(), vec![9; 8]);
}
