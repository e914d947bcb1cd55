// src/camera/sim.rs - Simulated camera producing synthetic frames
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CameraDevice, MemId, SdkStatus};

/// Generic failure code returned by scripted faults.
pub const SIM_FAILURE: SdkStatus = -1;

#[derive(Debug, Default)]
struct Shared {
    inits: usize,
    exits: usize,
    allocs: usize,
    frees: usize,
    freezes: usize,
    fail_step: Option<&'static str>,
    fail_freezes: Vec<usize>,
}

/// Counters observable after the camera is boxed into a [`super::CaptureAdapter`].
#[derive(Debug, Clone)]
pub struct SimCameraHandle {
    shared: Arc<Mutex<Shared>>,
}

impl SimCameraHandle {
    pub fn inits(&self) -> usize {
        lock(&self.shared).inits
    }

    pub fn exits(&self) -> usize {
        lock(&self.shared).exits
    }

    pub fn allocs(&self) -> usize {
        lock(&self.shared).allocs
    }

    pub fn frees(&self) -> usize {
        lock(&self.shared).frees
    }

    pub fn freezes(&self) -> usize {
        lock(&self.shared).freezes
    }
}

/// Camera that renders a gradient which shifts with every frame.
///
/// Rows are padded to a 4-byte pitch like the real image memory.
#[derive(Debug)]
pub struct SimulatedCamera {
    shared: Arc<Mutex<Shared>>,
    width: u32,
    height: u32,
    pitch: usize,
    frame: Vec<u8>,
    initialized: bool,
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            width: 0,
            height: 0,
            pitch: 0,
            frame: Vec::new(),
            initialized: false,
        }
    }

    /// Fail the named init step: "init", "display mode", "color mode", "image size",
    /// "image memory allocation" or "image memory".
    pub fn failing_at(self, step: &'static str) -> Self {
        lock(&self.shared).fail_step = Some(step);
        self
    }

    /// Make the n-th freeze (1-based) time out.
    pub fn failing_freeze(self, index: usize) -> Self {
        lock(&self.shared).fail_freezes.push(index);
        self
    }

    pub fn handle(&self) -> SimCameraHandle {
        SimCameraHandle { shared: self.shared.clone() }
    }

    fn step(&self, step: &'static str) -> SdkStatus {
        if lock(&self.shared).fail_step == Some(step) { SIM_FAILURE } else { 0 }
    }

    fn render(&mut self, seed: usize) {
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                let offset = y * self.pitch + x * 3;
                self.frame[offset] = ((x + seed * 7) % 256) as u8;
                self.frame[offset + 1] = ((y + seed * 3) % 256) as u8;
                self.frame[offset + 2] = ((x + y) % 256) as u8;
            }
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(shared: &Arc<Mutex<Shared>>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CameraDevice for SimulatedCamera {
    fn init(&mut self, _device_id: u32) -> SdkStatus {
        let code = self.step("init");
        if code == 0 {
            lock(&self.shared).inits += 1;
            self.initialized = true;
        }
        code
    }

    fn set_display_mode_dib(&mut self) -> SdkStatus {
        self.step("display mode")
    }

    fn set_color_mode_bgr8(&mut self) -> SdkStatus {
        self.step("color mode")
    }

    fn set_aoi(&mut self, _x: u32, _y: u32, width: u32, height: u32) -> SdkStatus {
        self.width = width;
        self.height = height;
        self.step("image size")
    }

    fn alloc_image_mem(&mut self, width: u32, height: u32, bits_per_pixel: u32) -> Result<MemId, SdkStatus> {
        let code = self.step("image memory allocation");
        if code != 0 {
            return Err(code);
        }
        let row = (width as usize * bits_per_pixel as usize).div_ceil(8);
        self.pitch = row.div_ceil(4) * 4;
        self.frame = vec![0; self.pitch * height as usize];
        lock(&self.shared).allocs += 1;
        Ok(MemId(1))
    }

    fn set_image_mem(&mut self, _mem: MemId) -> SdkStatus {
        self.step("image memory")
    }

    fn freeze_video(&mut self) -> SdkStatus {
        if !self.initialized {
            return SIM_FAILURE;
        }
        let index = {
            let mut shared = lock(&self.shared);
            shared.freezes += 1;
            if shared.fail_freezes.contains(&shared.freezes) {
                return SIM_FAILURE;
            }
            shared.freezes
        };
        self.render(index);
        0
    }

    fn image_mem_pitch(&mut self, _mem: MemId) -> Result<usize, SdkStatus> {
        Ok(self.pitch)
    }

    fn copy_image_mem(&mut self, _mem: MemId, buf: &mut [u8]) -> SdkStatus {
        if buf.len() != self.frame.len() {
            return SIM_FAILURE;
        }
        buf.copy_from_slice(&self.frame);
        0
    }

    fn free_image_mem(&mut self, _mem: MemId) -> SdkStatus {
        lock(&self.shared).frees += 1;
        self.frame.clear();
        0
    }

    fn exit(&mut self) -> SdkStatus {
        lock(&self.shared).exits += 1;
        self.initialized = false;
        0
    }
}
