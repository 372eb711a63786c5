use std::{error::Error, path::PathBuf, sync::Arc};

use dicom_streaming_volume::{
    DicomFileLoader, LoadContext, LoadOptions, LruFrameCache, PriorityScheduler, SortBy,
    VolumeLoadController, VolumeLoader, cache::value_range,
};
use image::GrayImage;
use log::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let directory = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dicom"));
    let (volume, metadata) =
        VolumeLoader::from_directory::<f32>(&directory, SortBy::InstanceNumber)?;

    let threads = std::thread::available_parallelism().map_or(4, |n| n.get());
    let context = LoadContext::<f32>::new(
        Arc::new(PriorityScheduler::new(threads)?),
        Arc::new(DicomFileLoader),
        Arc::new(LruFrameCache::with_mb_limit(1024)),
    )
    .with_metadata(Arc::new(metadata));
    let controller = VolumeLoadController::new(Arc::new(volume), context, LoadOptions::default());

    let Some(report) = controller.load_async(0).await? else {
        return Err("load was cancelled".into());
    };
    info!(
        "{} of {} frames loaded, {} failed",
        report.frames_loaded,
        report.num_frames,
        report.frames_failed()
    );

    let volume = controller.volume();
    let (frames, rows, columns) = volume.dim();
    let frame = volume
        .frame(frames / 2)
        .ok_or("volume has no frames")?;
    let pixels = frame.as_standard_layout();
    let values = pixels.as_slice().ok_or("frame is not contiguous")?;
    let (min, max) = value_range(values);
    let span = if max > min { max - min } else { 1.0 };
    let bytes: Vec<u8> = values
        .iter()
        .map(|&v| (((f64::from(v) - min) / span) * 255.0).round() as u8)
        .collect();

    let image = GrayImage::from_raw(columns as u32, rows as u32, bytes)
        .ok_or("frame does not match its geometry")?;
    image.save("result.png")?;
    Ok(())
}
