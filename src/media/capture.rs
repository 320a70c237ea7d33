//! Camera and microphone capture for broadcasters running on a desktop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::{Camera, NokhwaError};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::MediaAccessError;

use super::quality::QualityPreset;
use super::source::{LocalMedia, LocalTrack, MediaSource, TrackKind};

/// A decoded RGB frame handed to the encoder.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Send+Sync camera handle. The nokhwa Camera lives on a dedicated thread.
pub struct CameraHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Send+Sync microphone handle. The cpal::Stream (which is !Send) lives on
/// a dedicated thread; we communicate via the `running` flag.
pub struct MicrophoneHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl Drop for MicrophoneHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Opens the default camera and microphone at the requested preset.
///
/// Without sinks the devices are held but their output is dropped.
#[derive(Clone, Default)]
pub struct DeviceSource {
    camera_index: u32,
    frame_sink: Option<mpsc::Sender<RawFrame>>,
    audio_sink: Option<mpsc::Sender<Vec<f32>>>,
}

impl DeviceSource {
    pub fn new(camera_index: u32) -> Self {
        Self {
            camera_index,
            ..Default::default()
        }
    }

    pub fn with_frame_sink(mut self, sink: mpsc::Sender<RawFrame>) -> Self {
        self.frame_sink = Some(sink);
        self
    }

    /// Mono 48 kHz PCM in 20 ms chunks.
    pub fn with_audio_sink(mut self, sink: mpsc::Sender<Vec<f32>>) -> Self {
        self.audio_sink = Some(sink);
        self
    }
}

#[async_trait]
impl MediaSource for DeviceSource {
    async fn acquire(&self, quality: QualityPreset) -> Result<LocalMedia, MediaAccessError> {
        let camera = start_camera(self.camera_index, quality, self.frame_sink.clone()).await?;
        // Dropping `camera` on this error path releases the device.
        let microphone = start_microphone(self.audio_sink.clone()).await?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let tracks = vec![
            LocalTrack::new(TrackKind::Audio, format!("mic-{}", suffix), "livecast"),
            LocalTrack::new(TrackKind::Video, format!("camera-{}", suffix), "livecast"),
        ];
        Ok(LocalMedia::new(quality, tracks).holding((camera, microphone)))
    }
}

/// Start capturing video at the preset's resolution and frame rate.
async fn start_camera(
    device_index: u32,
    quality: QualityPreset,
    sink: Option<mpsc::Sender<RawFrame>>,
) -> Result<CameraHandle, MediaAccessError> {
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MediaAccessError>>();

    let thread = std::thread::spawn(move || {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(quality.width(), quality.height()),
                FrameFormat::MJPEG,
                quality.frame_rate(),
            ),
        ));

        let mut camera = match Camera::new(CameraIndex::Index(device_index), requested) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(classify_camera_error(&e)));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(classify_camera_error(&e)));
            return;
        }

        info!(
            "Camera started: {} ({}x{}@{})",
            camera.info().human_name(),
            quality.width(),
            quality.height(),
            quality.frame_rate()
        );
        let _ = ready_tx.send(Ok(()));

        let pause = std::time::Duration::from_millis(1000 / u64::from(quality.frame_rate()));
        while running_thread.load(Ordering::Relaxed) {
            match camera.frame() {
                Ok(frame) => {
                    let Some(sink) = &sink else {
                        std::thread::sleep(pause);
                        continue;
                    };
                    match frame.decode_image::<RgbFormat>() {
                        Ok(image) => {
                            let (width, height) = image.dimensions();
                            let _ = sink.try_send(RawFrame {
                                rgb: image.into_raw(),
                                width,
                                height,
                            });
                        }
                        Err(e) => error!("Frame decode failed: {}", e),
                    }
                }
                Err(e) => {
                    if running_thread.load(Ordering::Relaxed) {
                        error!("Camera frame error: {}", e);
                    }
                    break;
                }
            }
            std::thread::sleep(pause);
        }

        drop(camera);
        info!("Camera capture thread exiting");
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(CameraHandle {
            running,
            _thread: thread,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(MediaAccessError::DeviceBusy("camera thread exited".into())),
    }
}

/// Open the default input device.
async fn start_microphone(
    sink: Option<mpsc::Sender<Vec<f32>>>,
) -> Result<MicrophoneHandle, MediaAccessError> {
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MediaAccessError>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready_tx.send(Err(MediaAccessError::DeviceNotFound(
                "no input device available".into(),
            )));
            return;
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("Using input device: {}", device_name);

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut buffer = Vec::with_capacity(960);
        let stream = match device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    return;
                }
                let Some(sink) = &sink else { return };
                for &sample in data {
                    buffer.push(sample);
                    if buffer.len() == 960 {
                        let _ = sink.try_send(std::mem::take(&mut buffer));
                    }
                }
            },
            move |err| {
                error!("Audio capture error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(classify_stream_error(&e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(MediaAccessError::DeviceBusy(e.to_string())));
            return;
        }

        let _ = ready_tx.send(Ok(()));

        // Keep the stream alive until stopped
        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        drop(stream);
        info!("Audio capture thread exiting");
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(MicrophoneHandle {
            running,
            _thread: thread,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(MediaAccessError::DeviceBusy("audio thread exited".into())),
    }
}

fn classify_camera_error(e: &NokhwaError) -> MediaAccessError {
    let text = e.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("not authorized") {
        return MediaAccessError::PermissionDenied(text);
    }
    match e {
        NokhwaError::OpenDeviceError(..) | NokhwaError::OpenStreamError(_)
            if lowered.contains("busy") || lowered.contains("in use") =>
        {
            MediaAccessError::DeviceBusy(text)
        }
        NokhwaError::OpenDeviceError(..) => MediaAccessError::DeviceNotFound(text),
        NokhwaError::OpenStreamError(_) => MediaAccessError::DeviceBusy(text),
        NokhwaError::SetPropertyError { .. }
        | NokhwaError::GetPropertyError { .. }
        | NokhwaError::UnsupportedOperationError(_)
        | NokhwaError::NotImplementedError(_) => MediaAccessError::UnsupportedConstraints(text),
        _ => {
            warn!("Unclassified camera error: {}", text);
            MediaAccessError::DeviceNotFound(text)
        }
    }
}

fn classify_stream_error(e: &cpal::BuildStreamError) -> MediaAccessError {
    let text = e.to_string();
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => MediaAccessError::DeviceNotFound(text),
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => MediaAccessError::UnsupportedConstraints(text),
        _ if text.to_lowercase().contains("denied") => MediaAccessError::PermissionDenied(text),
        _ => MediaAccessError::DeviceBusy(text),
    }
}
