use std::io::{Cursor, Read};

use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::image::EncodedImage;
use crate::params::ImageFrame;
use crate::recordio::{ImageRecordHeader, RecordReader};
use crate::source::Source;

/// Splits one source into encoded images.
///
/// Open it with [`Demuxer::open`], pull records with [`Demuxer::next_record`]
/// until it returns `None`, and [`Demuxer::close`] it (or drop it) to release
/// the underlying handle. A framing error closes the demuxer: framing cannot
/// be resynchronized, so the rest of that source is skipped.
pub struct Demuxer {
    source_id: String,
    state: State,
    records_read: usize,
}

enum State {
    Whole(Source),
    RecordIo(RecordReader<Box<dyn Read + Send>>),
    Zip {
        archive: ZipArchive<Cursor<Vec<u8>>>,
        next_entry: usize,
    },
    Closed,
}

impl Demuxer {
    pub fn open(source: &Source, frame: ImageFrame) -> Result<Self> {
        let source_id = source.id();
        log::debug!("Opening {source_id} as {frame}");

        let state = match frame {
            ImageFrame::None => State::Whole(source.clone()),
            ImageFrame::RecordIo => {
                State::RecordIo(RecordReader::new(source.open()?, &source_id))
            }
            ImageFrame::Zip => {
                let bytes = source.read_all()?;
                let archive = ZipArchive::new(Cursor::new(bytes))
                    .map_err(|e| Error::container(&source_id, e))?;
                State::Zip {
                    archive,
                    next_entry: 0,
                }
            }
        };

        Ok(Self {
            source_id,
            state,
            records_read: 0,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn records_read(&self) -> usize {
        self.records_read
    }

    pub fn next_record(&mut self) -> Result<Option<EncodedImage>> {
        let result = self.advance();
        match &result {
            Ok(Some(_)) => self.records_read += 1,
            Ok(None) | Err(_) => self.close(),
        }
        result
    }

    /// Release the source. Further calls to `next_record` return `None`.
    pub fn close(&mut self) {
        if !matches!(self.state, State::Closed) {
            log::trace!("Closing {} after {} records", self.source_id, self.records_read);
        }
        self.state = State::Closed;
    }

    fn advance(&mut self) -> Result<Option<EncodedImage>> {
        let index = self.records_read;

        match &mut self.state {
            State::Closed => Ok(None),
            State::Whole(source) => {
                let data = source.read_all()?;
                let image = EncodedImage::new(data, self.source_id.clone());
                self.state = State::Closed;
                Ok(Some(image))
            }
            State::RecordIo(reader) => {
                let Some(payload) = reader.next_payload()? else {
                    return Ok(None);
                };
                let origin = format!("{}#{index}", self.source_id);
                let (header, image) = ImageRecordHeader::parse(&payload).ok_or_else(|| {
                    let reason = format!("record {index} has a truncated image header");
                    Error::container(&self.source_id, reason)
                })?;
                log::trace!("Record {origin}: id {} label {:?}", header.id, header.label);
                Ok(Some(EncodedImage::new(image.to_vec(), origin)))
            }
            State::Zip {
                archive,
                next_entry,
            } => {
                while *next_entry < archive.len() {
                    let i = *next_entry;
                    *next_entry += 1;

                    let mut file = archive
                        .by_index(i)
                        .map_err(|e| Error::container(&self.source_id, e))?;
                    let name = file.name().to_string();
                    if file.is_dir() || is_system_file(&name) {
                        continue;
                    }

                    let mut data = Vec::new();
                    file.read_to_end(&mut data)
                        .map_err(|e| Error::container(&self.source_id, format!("{name}: {e}")))?;
                    let origin = format!("{}:{name}", self.source_id);
                    return Ok(Some(EncodedImage::new(data, origin)));
                }
                Ok(None)
            }
        }
    }
}

impl Iterator for Demuxer {
    type Item = Result<EncodedImage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn is_system_file(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name.starts_with('.')
        || name.contains("__MACOSX")
        || file_name.eq_ignore_ascii_case("thumbs.db")
}
