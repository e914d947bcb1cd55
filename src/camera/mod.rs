// src/camera/mod.rs - Camera SDK boundary and capture adapter
pub mod sim;

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use thiserror::Error;

use crate::config::CameraConfig;
use crate::run::Run;

/// SDK return code. Zero is success.
pub type SdkStatus = i32;

/// Handle to an allocated image memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemId(pub u32);

/// Frames are 24-bit packed BGR.
pub const BITS_PER_PIXEL: u32 = 24;
const BYTES_PER_PIXEL: usize = 3;

/// The vendor camera SDK, consumed as an opaque service.
///
/// Calls block until the device answers; `freeze_video` returns once a full frame
/// sits in the active image memory.
pub trait CameraDevice: Send {
    fn init(&mut self, device_id: u32) -> SdkStatus;
    fn set_display_mode_dib(&mut self) -> SdkStatus;
    fn set_color_mode_bgr8(&mut self) -> SdkStatus;
    fn set_aoi(&mut self, x: u32, y: u32, width: u32, height: u32) -> SdkStatus;
    fn alloc_image_mem(&mut self, width: u32, height: u32, bits_per_pixel: u32) -> Result<MemId, SdkStatus>;
    fn set_image_mem(&mut self, mem: MemId) -> SdkStatus;
    fn freeze_video(&mut self) -> SdkStatus;
    /// Row stride of the image memory in bytes.
    fn image_mem_pitch(&mut self, mem: MemId) -> Result<usize, SdkStatus>;
    /// Copy `pitch * height` bytes of image memory into `buf`.
    fn copy_image_mem(&mut self, mem: MemId, buf: &mut [u8]) -> SdkStatus;
    fn free_image_mem(&mut self, mem: MemId) -> SdkStatus;
    fn exit(&mut self) -> SdkStatus;
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Camera initialization failed at {step}, code={code}")]
    DeviceInit { step: &'static str, code: SdkStatus },
    #[error("Capture failed at {step}, code={code}")]
    Capture { step: &'static str, code: SdkStatus },
    #[error("Camera is closed")]
    Closed,
    #[error("Failed to encode '{path}': {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scoped camera session: initialized once, released exactly once on `close` or drop.
pub struct CaptureAdapter {
    device: Box<dyn CameraDevice>,
    mem: Option<MemId>,
    width: u32,
    height: u32,
    flip_vertical: bool,
    open: bool,
}

impl CaptureAdapter {
    /// Bring the device up. On any failure, whatever was acquired is released before returning.
    pub fn init(device: Box<dyn CameraDevice>, config: &CameraConfig) -> Result<Self, CameraError> {
        let mut adapter = Self {
            device,
            mem: None,
            width: config.width,
            height: config.height,
            flip_vertical: config.flip_vertical,
            open: false,
        };

        let code = adapter.device.init(config.device_id);
        if code != 0 {
            tracing::error!("Error initializing camera. Error code: {}", code);
            return Err(CameraError::DeviceInit { step: "init", code });
        }
        adapter.open = true;

        // From here on, dropping `adapter` frees the device.
        let code = adapter.device.set_display_mode_dib();
        sdk_step("display mode", code)?;
        let code = adapter.device.set_color_mode_bgr8();
        sdk_step("color mode", code)?;
        let code = adapter.device.set_aoi(0, 0, config.width, config.height);
        sdk_step("image size", code)?;
        let mem = adapter
            .device
            .alloc_image_mem(config.width, config.height, BITS_PER_PIXEL)
            .map_err(|code| init_error("image memory allocation", code))?;
        adapter.mem = Some(mem);
        let code = adapter.device.set_image_mem(mem);
        sdk_step("image memory", code)?;

        tracing::info!("Camera initialization successful ({}x{})", config.width, config.height);
        Ok(adapter)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Grab one frame and write it to the run's next picture file.
    ///
    /// The picture number advances only when the file is written.
    pub fn capture(&mut self, run: &mut Run) -> Result<PathBuf, CameraError> {
        let mem = match (self.open, self.mem) {
            (true, Some(mem)) => mem,
            _ => return Err(CameraError::Closed),
        };
        let code = self.device.freeze_video();
        if code != 0 {
            return Err(CameraError::Capture { step: "freeze", code });
        }
        let pitch = self
            .device
            .image_mem_pitch(mem)
            .map_err(|code| CameraError::Capture { step: "pitch", code })?;
        if pitch < self.width as usize * BYTES_PER_PIXEL {
            return Err(CameraError::Capture { step: "pitch", code: -1 });
        }
        let mut raw = vec![0u8; pitch * self.height as usize];
        let code = self.device.copy_image_mem(mem, &mut raw);
        if code != 0 {
            return Err(CameraError::Capture { step: "read memory", code });
        }
        let rgb = bgr_to_rgb(&raw, self.width, self.height, pitch, self.flip_vertical);

        let path = run.next_picture_path();
        write_png(&path, &rgb, self.width, self.height)?;
        run.commit_picture();
        tracing::info!("Image saved at {}", path.display());
        Ok(path)
    }

    /// Free the image memory and exit the device. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(mem) = self.mem.take() {
            let code = self.device.free_image_mem(mem);
            if code != 0 {
                tracing::warn!("Freeing image memory returned {}", code);
            }
        }
        let code = self.device.exit();
        if code != 0 {
            tracing::warn!("Camera exit returned {}", code);
        }
        tracing::info!("Camera closed.");
    }
}

impl Drop for CaptureAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

fn sdk_step(step: &'static str, code: SdkStatus) -> Result<(), CameraError> {
    if code != 0 {
        return Err(init_error(step, code));
    }
    Ok(())
}

fn init_error(step: &'static str, code: SdkStatus) -> CameraError {
    tracing::error!("Error setting {}. Error code: {}", step, code);
    CameraError::DeviceInit { step, code }
}

/// Repack a pitched BGR frame into tight RGB rows, optionally flipped top to bottom.
pub fn bgr_to_rgb(raw: &[u8], width: u32, height: u32, pitch: usize, flip_vertical: bool) -> Vec<u8> {
    let row_len = width as usize * BYTES_PER_PIXEL;
    let height = height as usize;
    let mut rgb = Vec::with_capacity(row_len * height);
    for row in 0..height {
        let src_row = if flip_vertical { height - 1 - row } else { row };
        let start = src_row * pitch;
        let src = &raw[start..start + row_len];
        for px in src.chunks_exact(BYTES_PER_PIXEL) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    rgb
}

/// Encode an RGB frame as PNG. Refuses to overwrite an existing file.
fn write_png(path: &Path, rgb: &[u8], width: u32, height: u32) -> Result<(), CameraError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| CameraError::Io { path: path.to_path_buf(), source })?;
    let mut writer = BufWriter::new(file);
    let written = PngEncoder::new(&mut writer)
        .write_image(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|source| CameraError::Encode { path: path.to_path_buf(), source })
        .and_then(|()| {
            writer
                .flush()
                .map_err(|source| CameraError::Io { path: path.to_path_buf(), source })
        });
    if written.is_err() {
        // A half-written file would block this picture number for the rest of the run.
        drop(writer);
        let _ = std::fs::remove_file(path);
    }
    written
}
