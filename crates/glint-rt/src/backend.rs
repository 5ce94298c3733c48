//! Render backend contract and its Vulkan implementation.
//!
//! A backend owns its device objects outright; nothing is shared between
//! implementations beyond the scene description they consume. The frame
//! loop is strictly serial: every submission is fenced before any shared
//! object (descriptor set, SBT, view-parameter buffer, command buffer) is
//! touched again, which is the only reason single-buffering those objects
//! is sound. Per-frame buffering has to come first if frames are ever
//! pipelined.

use std::time::Instant;

use ash::vk;
use glam::Vec3;
use glint_core::{RenderStats, Scene};
use glint_gpu::{Buffer, Context, ContextBuilder, DescriptorPool};

use crate::camera::ViewParams;
use crate::error::{RenderError, Result};
use crate::frame::{FramePhase, FrameTargets};
use crate::mesh::GpuMesh;
use crate::pipeline::RayTracingPipeline;
use crate::sbt::ShaderBindingTable;
use crate::scene::{upload_materials, Tlas};
use crate::shaders::ShaderBlob;

/// Host-side interface a renderer exposes to an application.
pub trait RenderBackend {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    /// Allocate render targets for the given resolution and reset the frame
    /// counter. May be called again to resize.
    fn initialize(&mut self, width: u32, height: u32) -> Result<()>;

    /// Upload the scene and build everything the dispatch needs: BLAS per
    /// mesh, TLAS, pipeline, and shader binding table. Resets the frame
    /// counter.
    fn set_scene(&mut self, scene: &Scene) -> Result<()>;

    /// Render one frame and block until its pixels are host-visible.
    fn render(
        &mut self,
        pos: Vec3,
        dir: Vec3,
        up: Vec3,
        fovy_degrees: f32,
        camera_changed: bool,
    ) -> Result<RenderStats>;

    /// The last rendered frame as tightly packed row-major RGBA8.
    fn image(&self) -> &[u8];
}

/// Everything built by `set_scene`, torn down as one unit.
struct GpuScene {
    meshes: Vec<GpuMesh>,
    tlas: Tlas,
    material_buffer: Buffer,
    pipeline: RayTracingPipeline,
    sbt: ShaderBindingTable,
    descriptor_pool: DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    view_buffer: Buffer,
}

impl GpuScene {
    unsafe fn destroy(&mut self, ctx: &Context) -> Result<()> {
        self.descriptor_pool.destroy(ctx.device());
        self.pipeline.destroy(ctx);
        self.sbt.destroy(ctx)?;
        self.tlas.destroy(ctx)?;
        for mesh in &mut self.meshes {
            mesh.destroy(ctx)?;
        }
        let mut allocator = ctx.allocator().lock();
        allocator.free_buffer(&mut self.material_buffer)?;
        allocator.free_buffer(&mut self.view_buffer)?;
        Ok(())
    }
}

/// Ray tracing renderer over `VK_KHR_ray_tracing_pipeline`.
pub struct VulkanBackend {
    context: Context,
    blob: ShaderBlob,
    targets: Option<FrameTargets>,
    scene: Option<GpuScene>,
    image: Vec<u8>,
    frame_id: u32,
}

impl VulkanBackend {
    /// Create the backend around the given shader bytecode.
    ///
    /// Fails if no device with the ray-tracing extension set exists; there
    /// is no fallback path.
    pub fn new(blob: ShaderBlob) -> Result<Self> {
        let context = ContextBuilder::new().app_name("glint").build()?;
        Ok(Self {
            context,
            blob,
            targets: None,
            scene: None,
            image: Vec::new(),
            frame_id: 0,
        })
    }

    /// Create the backend with an explicit context configuration.
    pub fn with_context(context: Context, blob: ShaderBlob) -> Self {
        Self {
            context,
            blob,
            targets: None,
            scene: None,
            image: Vec::new(),
            frame_id: 0,
        }
    }

    /// The GPU context, for integration tests and tooling.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Frames accumulated since the camera last moved.
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }
}

impl RenderBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Ray Tracing"
    }

    fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe {
            self.context.sync()?;
            if let Some(mut old) = self.targets.take() {
                old.destroy(&self.context)?;
            }
            self.targets = Some(FrameTargets::new(&self.context, width, height)?);
        }
        self.image = vec![0; (width * height * 4) as usize];
        self.frame_id = 0;
        tracing::debug!(width, height, "initialized render targets");
        Ok(())
    }

    fn set_scene(&mut self, scene: &Scene) -> Result<()> {
        scene.validate()?;

        unsafe {
            self.context.sync()?;
            if let Some(mut old) = self.scene.take() {
                old.destroy(&self.context)?;
            }

            // Meshes build strictly one at a time; scratch for mesh i+1 is
            // not allocated until mesh i is finalized.
            let mut meshes = Vec::with_capacity(scene.meshes.len());
            for mesh_data in &scene.meshes {
                let mut mesh = GpuMesh::upload(&self.context, mesh_data)?;
                mesh.build_blas(&self.context)?;
                mesh.compact(&self.context)?;
                meshes.push(mesh);
            }

            let material_buffer = upload_materials(&self.context, &scene.materials)?;
            let tlas = Tlas::build(&self.context, &meshes)?;

            let pipeline =
                RayTracingPipeline::new(&self.context, &self.blob, meshes.len() as u32)?;
            let sbt = ShaderBindingTable::new(&self.context, &pipeline, &meshes)?;

            let pool_sizes = [
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(2),
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(1),
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1),
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1),
            ];
            let descriptor_pool = DescriptorPool::new(self.context.device(), 1, &pool_sizes)?;
            let descriptor_set = descriptor_pool
                .allocate(self.context.device(), &[pipeline.descriptor_set_layout()])?[0];

            let view_buffer = self.context.allocator().lock().create_buffer(
                ViewParams::BUFFER_SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                glint_gpu::MemoryClass::Upload,
                glint_gpu::ResourceState::ShaderRead,
                "view_params",
            )?;

            let triangles: u32 = meshes.iter().map(GpuMesh::triangle_count).sum();
            tracing::info!(
                meshes = meshes.len(),
                materials = scene.materials.len(),
                triangles,
                "scene built"
            );

            self.scene = Some(GpuScene {
                meshes,
                tlas,
                material_buffer,
                pipeline,
                sbt,
                descriptor_pool,
                descriptor_set,
                view_buffer,
            });
        }

        self.frame_id = 0;
        Ok(())
    }

    fn render(
        &mut self,
        pos: Vec3,
        dir: Vec3,
        up: Vec3,
        fovy_degrees: f32,
        camera_changed: bool,
    ) -> Result<RenderStats> {
        let targets = self
            .targets
            .as_mut()
            .ok_or_else(|| RenderError::InvalidState("initialize() not called".to_string()))?;
        let scene = self
            .scene
            .as_ref()
            .ok_or_else(|| RenderError::InvalidState("set_scene() not called".to_string()))?;

        if camera_changed {
            self.frame_id = 0;
        }

        let device = self.context.device();
        let mut phase = FramePhase::Idle;

        let params = ViewParams::pack(
            pos,
            dir,
            up,
            fovy_degrees,
            targets.width(),
            targets.height(),
            self.frame_id,
        );
        scene.view_buffer.write(&[params])?;

        let elapsed = unsafe {
            targets.write_descriptors(
                device,
                scene.descriptor_set,
                scene.tlas.handle(),
                &scene.material_buffer,
                &scene.view_buffer,
            );

            phase.advance(FramePhase::Recording)?;
            let cmd = self.context.begin_recording()?;
            targets.transition_for_dispatch(device, cmd);

            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                scene.pipeline.handle(),
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                scene.pipeline.layout(),
                0,
                &[scene.descriptor_set],
                &[],
            );

            let (raygen, miss, hit, callable) = scene.sbt.regions();
            self.context.rt_pipeline_loader().cmd_trace_rays(
                cmd,
                raygen,
                miss,
                hit,
                callable,
                targets.width(),
                targets.height(),
                1,
            );

            // Time only the traced work: submission to fence completion.
            let start = Instant::now();
            let value = self.context.submit_recorded()?;
            phase.advance(FramePhase::Submitted)?;
            self.context.fence().wait_blocking(device, value)?;
            let elapsed = start.elapsed();
            phase.advance(FramePhase::Synced)?;
            elapsed
        };

        unsafe {
            let cmd = self.context.begin_recording()?;
            targets.record_readback(device, cmd);
            let value = self.context.submit_recorded()?;
            self.context.fence().wait_blocking(device, value)?;
            phase.advance(FramePhase::ReadBack)?;
        }

        self.image = targets.read_pixels()?;
        phase.advance(FramePhase::Idle)?;

        let render_time = elapsed.as_secs_f64();
        let stats = RenderStats {
            render_time,
            rays_per_second: targets.pixel_count() as f64 / render_time,
        };

        tracing::debug!(
            frame_id = self.frame_id,
            render_time_ms = render_time * 1e3,
            rays_per_second = stats.rays_per_second,
            "frame complete"
        );

        self.frame_id += 1;
        Ok(stats)
    }

    fn image(&self) -> &[u8] {
        &self.image
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.context.wait_idle();
            if let Some(mut scene) = self.scene.take() {
                let _ = scene.destroy(&self.context);
            }
            if let Some(mut targets) = self.targets.take() {
                let _ = targets.destroy(&self.context);
            }
        }
    }
}
