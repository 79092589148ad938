use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use imageproc::image::{ImageFormat, Rgb, RgbImage};
use pixelfeed::recordio::{ImageRecordHeader, RecordWriter};
use pixelfeed::{
    list_files, Error, Example, FileListOptions, ImageFrame, ImageParams, ImageReader,
    LastBatchHandling, ReaderParams, ReaderState, Source,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn encode(width: u32, height: u32, color: [u8; 3], format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        // a little texture so resizing has something to do
        let shade = ((x + y) % 2) as u8;
        Rgb([color[0], color[1].saturating_add(shade), color[2]])
    });
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, format).unwrap();
    bytes.into_inner()
}

fn write_images(dir: &Path, count: usize, size: u32, format: ImageFormat) -> Vec<PathBuf> {
    let ext = if format == ImageFormat::Png { "png" } else { "jpg" };
    (0..count)
        .map(|i| {
            let path = dir.join(format!("test_image_{i}.{ext}"));
            let color = [i as u8 * 10, 100, 200];
            std::fs::write(&path, encode(size, size, color, format)).unwrap();
            path
        })
        .collect()
}

fn sources(paths: &[PathBuf]) -> Vec<Source> {
    paths.iter().map(Source::file).collect()
}

fn read_all(reader: &mut ImageReader) -> Vec<Example> {
    let mut examples = Vec::new();
    loop {
        match reader.read_example() {
            Ok(example) => examples.push(example),
            Err(Error::EndOfData) => return examples,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[test]
fn jpeg_resized_to_100() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 1, 100, ImageFormat::Jpeg);

    let params = ImageParams::new([3, 100, 100]).resize(100).to_rgb(true);
    let mut reader = ImageReader::new(ReaderParams::new(sources(&paths), 1), params).unwrap();

    let example = reader.read_example().unwrap();
    assert_eq!(example["value"].shape(), &[1, 100, 100, 3]);
    assert_eq!(example["value"].strides(), &[30000, 300, 3, 1]);
    assert!(reader.read_example().unwrap_err().is_end_of_data());
}

#[test]
fn png_resized_to_100() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 1, 100, ImageFormat::Png);

    let params = ImageParams::new([3, 100, 100]).resize(100).to_rgb(true);
    let mut reader = ImageReader::new(ReaderParams::new(sources(&paths), 1), params).unwrap();

    let example = reader.read_example().unwrap();
    assert_eq!(example.value().shape(), &[1, 100, 100, 3]);
    assert_eq!(example.value().strides(), &[30000, 300, 3, 1]);
}

#[test]
fn recordio_yields_one_example_per_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("images.rec");
    let mut writer = RecordWriter::new(File::create(&path).unwrap(), "images.rec");
    for id in 0..3 {
        let jpeg = encode(100, 100, [id as u8, 50, 50], ImageFormat::Jpeg);
        writer
            .write_image(&ImageRecordHeader::new(0.0, id), &jpeg)
            .unwrap();
    }
    writer.finish().unwrap();

    let params = ImageParams::new([3, 100, 100])
        .image_frame(ImageFrame::RecordIo)
        .resize(100)
        .to_rgb(true);
    let mut reader = ImageReader::new(ReaderParams::new(vec![Source::file(&path)], 1), params)
        .unwrap();

    let examples = read_all(&mut reader);
    assert_eq!(examples.len(), 3);
    for example in &examples {
        assert_eq!(example.value().shape(), &[1, 100, 100, 3]);
        assert_eq!(example.value().strides(), &[30000, 300, 3, 1]);
    }
    assert_eq!(reader.state(), ReaderState::Exhausted);
}

#[test]
fn exact_dimensions_without_resize() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 1, 50, ImageFormat::Png);

    let params = ImageParams::new([3, 50, 50]);
    let mut reader = ImageReader::new(ReaderParams::new(sources(&paths), 1), params).unwrap();

    let example = reader.read_example().unwrap();
    assert_eq!(example.value().shape(), &[1, 50, 50, 3]);
    assert_eq!(example.value().strides(), &[7500, 150, 3, 1]);
}

#[test]
fn wrong_dimensions_without_resize_fail() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 1, 50, ImageFormat::Png);

    let params = ImageParams::new([3, 100, 100]);
    let mut reader = ImageReader::new(ReaderParams::new(sources(&paths), 1), params).unwrap();

    match reader.read_example() {
        Err(Error::ShapeMismatch {
            actual_height: 50,
            actual_width: 50,
            ..
        }) => {}
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
}

#[test]
fn shorter_edge_scaled_then_center_cropped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wide.png");
    std::fs::write(&path, encode(200, 100, [1, 2, 3], ImageFormat::Png)).unwrap();
    let tall = dir.path().join("tall.png");
    std::fs::write(&tall, encode(30, 60, [1, 2, 3], ImageFormat::Png)).unwrap();

    let params = ImageParams::new([3, 64, 64]).resize(64);
    let dataset = vec![Source::file(&path), Source::file(&tall)];
    let mut reader = ImageReader::new(ReaderParams::new(dataset, 2), params).unwrap();

    let example = reader.read_example().unwrap();
    assert_eq!(example.value().shape(), &[2, 64, 64, 3]);
}

#[test]
fn decoded_pixels_are_bgr_unless_converted() {
    let png = encode(2, 2, [200, 100, 50], ImageFormat::Png);
    let dataset = vec![Source::memory("px.png", png)];

    let params = ImageParams::new([3, 2, 2]);
    let mut reader = ImageReader::new(ReaderParams::new(dataset.clone(), 1), params).unwrap();
    let bgr = reader.read_example().unwrap();
    assert_eq!(&bgr.value().data()[..3], &[50, 100, 200]);

    let params = ImageParams::new([3, 2, 2]).to_rgb(true);
    let mut reader = ImageReader::new(ReaderParams::new(dataset, 1), params).unwrap();
    let rgb = reader.read_example().unwrap();
    assert_eq!(&rgb.value().data()[..3], &[200, 100, 50]);
}

#[test]
fn grayscale_target_converts_with_to_rgb() {
    let png = encode(4, 4, [255, 255, 255], ImageFormat::Png);
    let dataset = vec![Source::memory("white.png", png)];

    let params = ImageParams::new([1, 4, 4]).to_rgb(true);
    let mut reader = ImageReader::new(ReaderParams::new(dataset.clone(), 1), params).unwrap();
    let example = reader.read_example().unwrap();
    assert_eq!(example.value().shape(), &[1, 4, 4, 1]);
    assert_eq!(example.value().strides(), &[16, 4, 1, 1]);

    let params = ImageParams::new([1, 4, 4]);
    let mut reader = ImageReader::new(ReaderParams::new(dataset, 1), params).unwrap();
    assert!(matches!(
        reader.read_example(),
        Err(Error::ChannelMismatch {
            expected: 1,
            actual: 3,
            ..
        })
    ));
}

#[test]
fn short_last_batch_is_an_error_by_default() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 3, 8, ImageFormat::Png);

    let params = ImageParams::new([3, 8, 8]);
    let mut reader = ImageReader::new(ReaderParams::new(sources(&paths), 4), params).unwrap();

    let err = reader.read_example().unwrap_err();
    assert!(matches!(
        err,
        Error::BatchSize {
            expected: 4,
            actual: 3,
            ..
        }
    ));
    let partial = err.into_partial_example().unwrap();
    assert_eq!(partial.value().shape(), &[3, 8, 8, 3]);

    assert_eq!(reader.state(), ReaderState::Exhausted);
    assert!(reader.read_example().unwrap_err().is_end_of_data());
}

#[test]
fn short_last_batch_can_be_dropped() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 5, 8, ImageFormat::Png);

    let params = ImageParams::new([3, 8, 8]);
    let reader_params =
        ReaderParams::new(sources(&paths), 2).last_batch(LastBatchHandling::Drop);
    let mut reader = ImageReader::new(reader_params, params).unwrap();

    let examples = read_all(&mut reader);
    assert_eq!(examples.len(), 2);
    assert!(examples.iter().all(|e| e.padding == 0));
}

#[test]
fn short_last_batch_can_be_padded() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 3, 8, ImageFormat::Png);

    let params = ImageParams::new([3, 8, 8]);
    let reader_params = ReaderParams::new(sources(&paths), 4).last_batch(LastBatchHandling::Pad);
    let mut reader = ImageReader::new(reader_params, params).unwrap();

    let examples = read_all(&mut reader);
    assert_eq!(examples.len(), 1);
    let example = &examples[0];
    assert_eq!(example.padding, 1);
    assert_eq!(example.value().shape(), &[4, 8, 8, 3]);
    assert!(example.value().image(3).unwrap().iter().all(|&b| b == 0));
    assert!(example.value().image(0).unwrap().iter().any(|&b| b != 0));
}

#[test]
fn reads_are_deterministic() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 4, 40, ImageFormat::Jpeg);
    let params = ImageParams::new([3, 32, 32]).resize(32).to_rgb(true);

    let first = read_all(
        &mut ImageReader::new(ReaderParams::new(sources(&paths), 2), params.clone()).unwrap(),
    );
    let second =
        read_all(&mut ImageReader::new(ReaderParams::new(sources(&paths), 2), params).unwrap());

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

#[test]
fn prefetch_matches_synchronous_reads() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 6, 16, ImageFormat::Png);
    let params = ImageParams::new([3, 16, 16]);

    let sync = read_all(
        &mut ImageReader::new(ReaderParams::new(sources(&paths), 2), params.clone()).unwrap(),
    );
    let prefetched = read_all(
        &mut ImageReader::new(ReaderParams::new(sources(&paths), 2).prefetch(true), params)
            .unwrap(),
    );

    assert_eq!(sync.len(), 3);
    assert_eq!(sync, prefetched);
}

#[test]
fn dropping_a_prefetching_reader_mid_stream() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 6, 16, ImageFormat::Png);
    let params = ImageParams::new([3, 16, 16]);

    let mut reader =
        ImageReader::new(ReaderParams::new(sources(&paths), 1).prefetch(true), params).unwrap();
    reader.read_example().unwrap();
    drop(reader);
}

#[test]
fn reset_replays_the_dataset() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 3, 16, ImageFormat::Png);
    let params = ImageParams::new([3, 16, 16]);

    for prefetch in [false, true] {
        let reader_params = ReaderParams::new(sources(&paths), 1).prefetch(prefetch);
        let mut reader = ImageReader::new(reader_params, params.clone()).unwrap();

        let first = read_all(&mut reader);
        assert_eq!(reader.state(), ReaderState::Exhausted);

        reader.reset().unwrap();
        assert_eq!(reader.state(), ReaderState::Ready);
        assert_eq!(reader.num_examples_read(), 0);
        let second = read_all(&mut reader);
        assert_eq!(first, second);
    }
}

#[test]
fn peek_does_not_consume() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 2, 16, ImageFormat::Png);
    let params = ImageParams::new([3, 16, 16]);
    let mut reader = ImageReader::new(ReaderParams::new(sources(&paths), 1), params).unwrap();

    let peeked = reader.peek_example().unwrap().clone();
    assert_eq!(reader.num_examples_read(), 0);
    assert_eq!(reader.read_example().unwrap(), peeked);

    assert!(reader.has_next());
    reader.read_example().unwrap();
    assert!(!reader.has_next());
    assert!(reader.peek_example().unwrap_err().is_end_of_data());
}

#[test]
fn zip_frame_reads_every_entry() {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for i in 0..3u8 {
        zip.start_file(format!("page{i}.png"), options).unwrap();
        zip.write_all(&encode(10, 10, [i, i, i], ImageFormat::Png))
            .unwrap();
    }
    zip.start_file(".hidden", options).unwrap();
    zip.write_all(b"not an image").unwrap();
    let bytes = zip.finish().unwrap().into_inner();

    let params = ImageParams::new([3, 10, 10]).image_frame(ImageFrame::Zip);
    let dataset = vec![Source::memory("pages.zip", bytes)];
    let mut reader = ImageReader::new(ReaderParams::new(dataset, 3), params).unwrap();

    let examples = read_all(&mut reader);
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].value().shape(), &[3, 10, 10, 3]);
}

#[test]
fn sharded_readers_split_the_dataset() {
    let dir = TempDir::new().unwrap();
    let paths = write_images(dir.path(), 6, 8, ImageFormat::Png);
    let params = ImageParams::new([3, 8, 8]);

    let mut total = 0;
    for shard in 0..2 {
        let reader_params = ReaderParams::new(sources(&paths), 1).shard(shard, 2);
        let mut reader = ImageReader::new(reader_params, params.clone()).unwrap();
        total += read_all(&mut reader).len();
    }
    assert_eq!(total, 6);

    let reader_params = ReaderParams::new(sources(&paths), 1).skip(1).limit(3);
    let mut reader = ImageReader::new(reader_params, params).unwrap();
    assert_eq!(reader.by_ref().count(), 3);
}

#[test]
fn directories_expand_in_natural_order() {
    let dir = TempDir::new().unwrap();
    for name in ["img10.png", "img2.png", "img1.png", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }

    let opts = FileListOptions {
        pattern: Some("*.png".into()),
        ..Default::default()
    };
    let files = list_files(&[dir.path()], &opts).unwrap();
    let names: Vec<_> = files
        .iter()
        .map(|s| match s {
            Source::File(path) => path.file_name().unwrap().to_string_lossy().into_owned(),
            Source::Memory { id, .. } => id.clone(),
        })
        .collect();
    assert_eq!(names, ["img1.png", "img2.png", "img10.png"]);
}

#[test]
fn corrupt_image_fails_the_read() {
    let mut png = encode(8, 8, [1, 2, 3], ImageFormat::Png);
    png.truncate(40);
    let dataset = vec![Source::memory("broken.png", png)];

    let params = ImageParams::new([3, 8, 8]);
    let mut reader = ImageReader::new(ReaderParams::new(dataset, 1), params).unwrap();
    assert!(matches!(reader.read_example(), Err(Error::Decode { .. })));
}
