//! Pure-Rust CPU engine that resamples instead of running a network.
//!
//! It honours the full engine contract (handle registry, status codes, weight
//! file presence check, 3- or 4-channel packed output), which makes it a
//! drop-in for hosts without a native kernel.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use image::imageops::FilterType;
use tracing::{debug, info, warn};

use super::{
    EngineHandle, EngineInitParams, InferenceEngine, STATUS_DEVICE_UNAVAILABLE,
    STATUS_INVALID_ARGUMENT, STATUS_MODEL_NOT_FOUND,
};
use crate::variant::ModelVariant;

#[derive(Debug, Clone, Copy)]
struct Instance {
    scale: u32,
    denoise: i32,
}

pub struct ResampleEngine {
    device_count: i32,
    next_handle: AtomicI64,
    instances: DashMap<i64, Instance>,
}

impl ResampleEngine {
    pub fn new() -> Self {
        Self::with_device_count(1)
    }

    /// `device_count` virtual accelerators are accepted in addition to CPU (-1).
    pub fn with_device_count(device_count: i32) -> Self {
        Self {
            device_count: device_count.max(0),
            next_handle: AtomicI64::new(1),
            instances: DashMap::new(),
        }
    }

    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    fn filter_for(denoise: i32) -> FilterType {
        if denoise > 0 {
            FilterType::Triangle
        } else {
            FilterType::CatmullRom
        }
    }
}

impl Default for ResampleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for ResampleEngine {
    fn name(&self) -> &str {
        "resample"
    }

    fn init(&self, params: &EngineInitParams) -> i64 {
        if !(2..=4).contains(&params.scale)
            || !(-1..=3).contains(&params.denoise)
            || !(0..=3).contains(&params.sync_gap)
        {
            warn!(
                target: "cugan_engine",
                scale = params.scale,
                denoise = params.denoise,
                sync_gap = params.sync_gap,
                "init: invalid argument"
            );
            return STATUS_INVALID_ARGUMENT;
        }
        if params.device < -1 || params.device >= self.device_count {
            warn!(target: "cugan_engine", device = params.device, "init: invalid device id");
            return STATUS_DEVICE_UNAVAILABLE;
        }

        let dir = params.variant_path();
        let (param_file, bin_file) = ModelVariant::weight_files(params.scale, params.denoise);
        if !dir.join(&param_file).is_file() || !dir.join(&bin_file).is_file() {
            warn!(
                target: "cugan_engine",
                dir = %dir.display(),
                param = %param_file,
                bin = %bin_file,
                "init: model file not found"
            );
            return STATUS_MODEL_NOT_FOUND;
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.instances.insert(
            handle,
            Instance {
                scale: params.scale as u32,
                denoise: params.denoise,
            },
        );
        info!(
            target: "cugan_engine",
            handle,
            model = %params.model_dir,
            scale = params.scale,
            denoise = params.denoise,
            device = params.device,
            "init: instance ready"
        );
        handle
    }

    fn compute(&self, handle: EngineHandle, image: &[u8]) -> Result<Vec<u8>> {
        let instance = self
            .instances
            .get(&handle.raw())
            .map(|entry| *entry)
            .ok_or_else(|| anyhow!("instance of handle {handle} not found"))?;

        let src = image::load_from_memory(image).context("input is not webp, png or jpeg")?;
        let out_w = src.width() * instance.scale;
        let out_h = src.height() * instance.scale;
        let has_alpha = src.color().has_alpha();
        debug!(
            target: "cugan_engine",
            %handle,
            src_w = src.width(),
            src_h = src.height(),
            has_alpha,
            "compute: start"
        );

        let resized = src.resize_exact(out_w, out_h, Self::filter_for(instance.denoise));
        let packed = if has_alpha {
            resized.to_rgba8().into_raw()
        } else {
            resized.to_rgb8().into_raw()
        };

        debug!(target: "cugan_engine", %handle, out_w, out_h, bytes = packed.len(), "compute: done");
        Ok(packed)
    }

    fn dispose(&self, handle: EngineHandle) {
        if self.instances.remove(&handle.raw()).is_none() {
            warn!(target: "cugan_engine", %handle, "dispose: unknown handle");
        }
    }

    fn is_reentrant(&self) -> bool {
        true
    }
}
