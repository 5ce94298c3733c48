//! GPU integration tests.
//!
//! These run against a real device with the ray-tracing extension set and
//! are ignored by default. Run them on capable hardware with
//! `cargo test -- --ignored`. The full-frame test additionally needs shader
//! bytecode supplied through `GLINT_SHADER_BLOB`.

use glam::Vec3;
use glint_core::{Material, MeshData, Scene};
use glint_gpu::{transition_buffer, ContextBuilder, MemoryClass, ResourceState};
use glint_rt::{RenderBackend, ShaderBlob, VulkanBackend};

use ash::vk;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .try_init();
}

#[test]
#[ignore = "requires an RT-capable GPU"]
fn buffer_upload_readback_round_trip() {
    init_logging();
    let ctx = ContextBuilder::new()
        .app_name("glint-test")
        .build()
        .expect("no ray tracing capable device");
    let device = ctx.device();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let size = payload.len() as u64;

    let mut allocator = ctx.allocator().lock();
    let upload = allocator
        .create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryClass::Upload,
            ResourceState::Undefined,
            "test_upload",
        )
        .unwrap();
    upload.write_bytes(0, &payload).unwrap();

    let mut device_local = allocator
        .create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryClass::DeviceLocal,
            ResourceState::Undefined,
            "test_device",
        )
        .unwrap();
    let readback = allocator
        .create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryClass::Readback,
            ResourceState::Undefined,
            "test_readback",
        )
        .unwrap();
    drop(allocator);

    ctx.submit_and_wait(|cmd| unsafe {
        transition_buffer(device, cmd, &mut device_local, ResourceState::CopyDst);
        let copy = vk::BufferCopy::default().size(size);
        device.cmd_copy_buffer(cmd, upload.buffer, device_local.buffer, &[copy]);
        transition_buffer(device, cmd, &mut device_local, ResourceState::CopySrc);
        device.cmd_copy_buffer(cmd, device_local.buffer, readback.buffer, &[copy]);
        Ok(())
    })
    .unwrap();

    let mut result = vec![0u8; payload.len()];
    readback.read_bytes(0, &mut result).unwrap();
    assert_eq!(result, payload);

    let mut allocator = ctx.allocator().lock();
    for buffer in [upload, device_local, readback].iter_mut() {
        allocator.free_buffer(buffer).unwrap();
    }
}

#[test]
#[ignore = "requires an RT-capable GPU"]
fn fence_values_strictly_increase() {
    init_logging();
    let ctx = ContextBuilder::new()
        .app_name("glint-test")
        .build()
        .expect("no ray tracing capable device");

    let mut last = 0;
    for _ in 0..3 {
        let value = ctx.submit_and_wait(|_| Ok(())).unwrap();
        assert!(value > last);
        last = value;
    }
    unsafe {
        assert!(ctx.fence().completed_value(ctx.device()).unwrap() >= last);
    }
}

/// Two triangles spanning the whole view, one flat white material.
fn white_quad_scene() -> Scene {
    let vertices = vec![
        [-1.0, -1.0, -2.0],
        [1.0, -1.0, -2.0],
        [1.0, 1.0, -2.0],
        [-1.0, 1.0, -2.0],
    ];
    let indices = vec![[0, 1, 2], [0, 2, 3]];
    Scene {
        meshes: vec![MeshData::new(vertices, indices, 0)],
        materials: vec![Material::matte(Vec3::ONE)],
    }
}

#[test]
#[ignore = "requires an RT-capable GPU and GLINT_SHADER_BLOB"]
fn renders_opaque_frame() {
    init_logging();
    let path = std::env::var("GLINT_SHADER_BLOB").expect("GLINT_SHADER_BLOB not set");
    let bytes = std::fs::read(path).expect("failed to read shader blob");
    let blob = ShaderBlob::from_bytes(&bytes).unwrap();

    let mut backend = VulkanBackend::new(blob).expect("no ray tracing capable device");
    backend.initialize(64, 64).unwrap();
    backend.set_scene(&white_quad_scene()).unwrap();

    let stats = backend
        .render(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 65.0, true)
        .unwrap();
    assert!(stats.render_time > 0.0);
    assert!(stats.rays_per_second > 0.0);

    let image = backend.image();
    assert_eq!(image.len(), 64 * 64 * 4);
    // Every ray either hits the quad or runs the miss shader; alpha is
    // written unconditionally.
    assert!(image.chunks_exact(4).all(|px| px[3] == 255));

    // Camera unchanged: the frame counter advances without a reset.
    backend
        .render(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 65.0, false)
        .unwrap();
    assert_eq!(backend.frame_id(), 2);
}
