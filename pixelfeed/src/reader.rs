//! The image reader: dataset in, batched examples out

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::batch::{assemble, BatchAssembler};
use crate::container::Demuxer;
use crate::error::{Error, Result};
use crate::image::{self, EncodedImage};
use crate::params::{ImageFrame, ImageParams, LastBatchHandling, ReaderParams};
use crate::source::Source;
use crate::tensor::Example;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Ready,
    Reading,
    Exhausted,
}

/// Reads a dataset of images as fixed-shape batches.
///
/// ```no_run
/// use pixelfeed::{ImageParams, ImageReader, ReaderParams, Source};
///
/// let dataset = vec![Source::file("test_image_0.jpg")];
/// let params = ImageParams::new([3, 100, 100]).resize(100).to_rgb(true);
/// let mut reader = ImageReader::new(ReaderParams::new(dataset, 1), params)?;
///
/// let example = reader.read_example()?;
/// assert_eq!(example["value"].shape(), &[1, 100, 100, 3]);
/// assert_eq!(example["value"].strides(), &[30000, 300, 3, 1]);
/// # Ok::<(), pixelfeed::Error>(())
/// ```
pub struct ImageReader {
    reader_params: ReaderParams,
    image_params: ImageParams,
    backend: Backend,
    peeked: Option<Example>,
    /// Error hit by `has_next`, returned by the next read.
    deferred: Option<Error>,
    state: ReaderState,
    num_examples_read: usize,
}

impl ImageReader {
    pub fn new(reader_params: ReaderParams, image_params: ImageParams) -> Result<Self> {
        if !crate::supports_image_reader() {
            return Err(Error::UnsupportedFeature("image reader"));
        }
        reader_params.validate()?;
        image_params.validate()?;
        if image_params.batch_bytes(reader_params.batch_size).is_none() {
            return Err(Error::config(format!(
                "batch of {} images of {:?} is too large",
                reader_params.batch_size, image_params.image_dimensions
            )));
        }

        log::debug!(
            "Image reader over {} sources, batch size {}, {:?}",
            reader_params.dataset.len(),
            reader_params.batch_size,
            image_params
        );

        let backend = Backend::start(&reader_params, &image_params)?;
        Ok(Self {
            reader_params,
            image_params,
            backend,
            peeked: None,
            deferred: None,
            state: ReaderState::Ready,
            num_examples_read: 0,
        })
    }

    pub fn reader_params(&self) -> &ReaderParams {
        &self.reader_params
    }

    pub fn image_params(&self) -> &ImageParams {
        &self.image_params
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn num_examples_read(&self) -> usize {
        self.num_examples_read
    }

    /// Read the next batch.
    ///
    /// Returns [`Error::EndOfData`] once the dataset is drained. What happens
    /// to a final incomplete batch depends on
    /// [`ReaderParams::last_batch_handling`].
    #[tracing::instrument(level = "debug", skip(self), fields(read = self.num_examples_read))]
    pub fn read_example(&mut self) -> Result<Example> {
        let result = match (self.peeked.take(), self.deferred.take()) {
            (Some(example), _) => Ok(example),
            (None, Some(error)) => Err(error),
            (None, None) => self.fetch(),
        };
        if result.is_ok() {
            self.num_examples_read += 1;
        }
        result
    }

    /// Look at the next batch without consuming it.
    ///
    /// An error is handed out right away and not kept.
    pub fn peek_example(&mut self) -> Result<&Example> {
        if let Some(error) = self.deferred.take() {
            return Err(error);
        }
        let example = match self.peeked.take() {
            Some(example) => example,
            None => self.fetch()?,
        };
        Ok(self.peeked.insert(example))
    }

    /// Whether another `read_example` call returns something other than
    /// end of data. Errors count as something: they are kept and returned by
    /// the next read.
    pub fn has_next(&mut self) -> bool {
        if self.peeked.is_none() && self.deferred.is_none() {
            match self.fetch() {
                Ok(example) => self.peeked = Some(example),
                Err(error) => self.deferred = Some(error),
            }
        }
        !matches!(self.deferred, Some(Error::EndOfData))
    }

    /// Start over from the first example.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting image reader after {} examples", self.num_examples_read);

        // stop any background work before opening the dataset again
        self.backend = Backend::Idle;
        self.backend = Backend::start(&self.reader_params, &self.image_params)?;
        self.peeked = None;
        self.deferred = None;
        self.state = ReaderState::Ready;
        self.num_examples_read = 0;
        Ok(())
    }

    fn fetch(&mut self) -> Result<Example> {
        if self.state == ReaderState::Exhausted {
            return Err(Error::EndOfData);
        }

        self.state = ReaderState::Reading;
        let result = self.backend.next_example();
        self.state = match &result {
            Err(Error::EndOfData) | Err(Error::BatchSize { .. }) => ReaderState::Exhausted,
            _ => ReaderState::Ready,
        };
        result
    }
}

impl Iterator for ImageReader {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_example() {
            Err(Error::EndOfData) => None,
            result => Some(result),
        }
    }
}

enum Backend {
    Sync(Box<Pipeline>),
    Prefetch(Prefetcher),
    Idle,
}

impl Backend {
    fn start(reader_params: &ReaderParams, image_params: &ImageParams) -> Result<Self> {
        let pipeline = Pipeline::new(reader_params, image_params);
        if reader_params.num_prefetched_examples > 0 {
            Ok(Backend::Prefetch(Prefetcher::spawn(pipeline)?))
        } else {
            Ok(Backend::Sync(Box::new(pipeline)))
        }
    }

    fn next_example(&mut self) -> Result<Example> {
        match self {
            Backend::Sync(pipeline) => pipeline.next_example(),
            Backend::Prefetch(prefetcher) => prefetcher.next_example(),
            Backend::Idle => Err(Error::EndOfData),
        }
    }
}

/// Runs the pipeline on a worker thread, at most one example ahead.
struct Prefetcher {
    rx: Option<mpsc::Receiver<Result<Example>>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Prefetcher {
    fn spawn(mut pipeline: Pipeline) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        pipeline.stop = Some(stop.clone());

        let worker_stop = stop.clone();
        Self::start(stop, move |tx| {
            while !worker_stop.load(Ordering::Relaxed) {
                let result = pipeline.next_example();
                let done = pipeline.exhausted;
                if tx.send(result).is_err() || done {
                    break;
                }
            }
            log::trace!("Prefetch worker stopped");
        })
    }

    fn start<F>(stop: Arc<AtomicBool>, work: F) -> Result<Self>
    where
        F: FnOnce(mpsc::SyncSender<Result<Example>>) + Send + 'static,
    {
        // rendezvous channel: the worker blocks on the finished example until
        // the caller takes it, so only one batch is ever decoded ahead
        let (tx, rx) = mpsc::sync_channel(0);
        let handle = thread::Builder::new()
            .name("pixelfeed-prefetch".into())
            .spawn(move || work(tx))
            .map_err(|error| Error::Io {
                source_id: "prefetch worker".into(),
                error,
            })?;

        Ok(Self {
            rx: Some(rx),
            stop,
            handle: Some(handle),
        })
    }

    /// Next example from the worker. A worker panic is raised again on the
    /// calling thread, as it would be without prefetching.
    fn next_example(&mut self) -> Result<Example> {
        let Some(rx) = &self.rx else {
            return Err(Error::EndOfData);
        };
        if let Ok(result) = rx.recv() {
            return result;
        }

        // the worker hung up: it either finished or panicked
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
        Err(Error::EndOfData)
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // dropping the receiver unblocks a worker waiting in `send`
        drop(self.rx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Prefetch worker panicked");
            }
        }
    }
}

/// Everything needed to produce examples, independent of threading.
struct Pipeline {
    cursor: InstanceCursor,
    image_params: ImageParams,
    batch_size: usize,
    last_batch: LastBatchHandling,
    exhausted: bool,
    stop: Option<Arc<AtomicBool>>,
}

impl Pipeline {
    fn new(reader_params: &ReaderParams, image_params: &ImageParams) -> Self {
        Self {
            cursor: InstanceCursor::new(reader_params, image_params.image_frame),
            image_params: image_params.clone(),
            batch_size: reader_params.batch_size,
            last_batch: reader_params.last_batch_handling,
            exhausted: false,
            stop: None,
        }
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::Relaxed))
    }

    fn next_example(&mut self) -> Result<Example> {
        if self.exhausted {
            return Err(Error::EndOfData);
        }

        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            if self.stopped() {
                return Err(Error::EndOfData);
            }
            match self.cursor.next_instance()? {
                Some(encoded) => batch.push(encoded),
                None => break,
            }
        }

        let short = batch.len() < self.batch_size;
        if short {
            self.exhausted = true;
            if batch.is_empty() {
                log::debug!("Dataset drained");
                return Err(Error::EndOfData);
            }
            if self.last_batch == LastBatchHandling::Drop {
                log::debug!("Dropping last batch of {} images", batch.len());
                return Err(Error::EndOfData);
            }
        }

        self.build(batch, short)
    }

    fn build(&self, batch: Vec<EncodedImage>, short: bool) -> Result<Example> {
        let images = image::process_batch(batch, &self.image_params)?;

        if short && self.last_batch == LastBatchHandling::Pad {
            let mut assembler = BatchAssembler::new(self.batch_size, &self.image_params);
            for img in &images {
                assembler.push(img)?;
            }
            let padded = assembler.pad();
            log::debug!("Padded last batch with {padded} images");
            return assembler.finish();
        }

        assemble(&images, self.batch_size, &self.image_params)
    }
}

/// Walks sources then records in dataset order, applying the instance
/// window (skip, limit) and then sharding.
struct InstanceCursor {
    dataset: Vec<Source>,
    frame: ImageFrame,
    next_source: usize,
    demuxer: Option<Demuxer>,
    to_skip: usize,
    remaining: Option<usize>,
    position: usize,
    shard_index: usize,
    num_shards: usize,
}

impl InstanceCursor {
    fn new(params: &ReaderParams, frame: ImageFrame) -> Self {
        Self {
            dataset: params.dataset.clone(),
            frame,
            next_source: 0,
            demuxer: None,
            to_skip: params.num_instances_to_skip,
            remaining: params.num_instances_to_read,
            position: 0,
            shard_index: params.shard_index,
            num_shards: params.num_shards,
        }
    }

    fn next_instance(&mut self) -> Result<Option<EncodedImage>> {
        loop {
            if self.remaining == Some(0) {
                self.close();
                return Ok(None);
            }

            let Some(encoded) = self.next_raw()? else {
                return Ok(None);
            };

            if self.to_skip > 0 {
                self.to_skip -= 1;
                continue;
            }

            let position = self.position;
            self.position += 1;
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }

            if position % self.num_shards == self.shard_index {
                return Ok(Some(encoded));
            }
        }
    }

    fn next_raw(&mut self) -> Result<Option<EncodedImage>> {
        loop {
            if let Some(demuxer) = &mut self.demuxer {
                if let Some(encoded) = demuxer.next_record()? {
                    return Ok(Some(encoded));
                }
                self.demuxer = None;
            }

            let Some(source) = self.dataset.get(self.next_source) else {
                return Ok(None);
            };
            self.next_source += 1;
            self.demuxer = Some(Demuxer::open(source, self.frame)?);
        }
    }

    fn close(&mut self) {
        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.close();
        }
    }
}
