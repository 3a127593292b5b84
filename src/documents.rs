//! Stream resource and datum documents.
//!
//! Detector data is not read inline. Instead a writer emits:
//!
//! - one **resource** per dataset per acquisition, naming the file and the
//!   dataset inside it
//! - a **datum** each time more indices are written, covering exactly the new
//!   index range `[last_emitted, indices_written)`
//!
//! [`HdfDocumentComposer`] holds that bookkeeping for one file. Datum ranges
//! for a dataset never overlap and never skip an index, however often the
//! composer is polled.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mimetype of SWMR HDF5 resources.
pub const HDF5_MIMETYPE: &str = "application/x-hdf5";

/// One dataset a writer produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdfDataset {
    /// Field name in the event stream
    pub data_key: String,
    /// Path of the dataset inside the file
    pub dataset: String,
    /// Shape of one frame
    pub shape: Vec<usize>,
    /// Numpy dtype tag of one element
    pub dtype_numpy: String,
    /// Frames written per logical event
    pub multiplier: u64,
    /// Whether the file is opened in single-writer/multiple-reader mode
    pub swmr: bool,
    /// Chunking of the dataset on disk
    pub chunk_shape: Vec<usize>,
}

impl HdfDataset {
    /// Dataset with one frame per event, SWMR on, chunked one frame at a time.
    pub fn new(data_key: impl Into<String>, dataset: impl Into<String>, shape: Vec<usize>) -> Self {
        let mut chunk_shape = vec![1];
        chunk_shape.extend(&shape);
        Self {
            data_key: data_key.into(),
            dataset: dataset.into(),
            shape,
            dtype_numpy: String::new(),
            multiplier: 1,
            swmr: true,
            chunk_shape,
        }
    }

    /// Set the numpy dtype tag.
    pub fn with_dtype(mut self, dtype_numpy: impl Into<String>) -> Self {
        self.dtype_numpy = dtype_numpy.into();
        self
    }

    /// Set the frames written per logical event.
    pub fn with_multiplier(mut self, multiplier: u64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the on-disk chunking.
    pub fn with_chunk_shape(mut self, chunk_shape: Vec<usize>) -> Self {
        self.chunk_shape = chunk_shape;
        self
    }
}

/// Free-form parameters of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceParameters {
    /// Dataset path inside the file
    pub dataset: String,
    /// Single-writer/multiple-reader mode
    pub swmr: bool,
    /// Frames per logical event
    pub multiplier: u64,
    /// On-disk chunking
    pub chunk_shape: Vec<usize>,
}

/// Announces that a dataset exists and where to find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResource {
    /// Unique id referenced by datums
    pub uid: String,
    /// Field this resource carries
    pub data_key: String,
    /// Format of the file
    pub mimetype: String,
    /// Location of the file
    pub uri: String,
    /// Format-specific parameters
    pub parameters: ResourceParameters,
}

/// Half-open index range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    /// First index covered
    pub start: u64,
    /// One past the last index covered
    pub stop: u64,
}

impl IndexRange {
    /// Number of indices covered.
    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// Announces that a range of indices is available in a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDatum {
    /// `{resource_uid}/{sequence}`
    pub uid: String,
    /// Resource this datum belongs to
    pub resource_uid: String,
    /// Indices now available
    pub index_range: IndexRange,
}

/// A document emitted by a writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "snake_case")]
pub enum StreamAsset {
    /// A new resource
    StreamResource(StreamResource),
    /// New data in a resource
    StreamDatum(StreamDatum),
}

/// A resource plus the cursor of what has been announced from it.
#[derive(Debug, Clone)]
pub struct StreamResourceBundle {
    resource: StreamResource,
    last_emitted: u64,
    datum_count: u64,
}

impl StreamResourceBundle {
    fn new(uri: &str, dataset: &HdfDataset) -> Self {
        Self {
            resource: StreamResource {
                uid: Uuid::new_v4().to_string(),
                data_key: dataset.data_key.clone(),
                mimetype: HDF5_MIMETYPE.to_string(),
                uri: uri.to_string(),
                parameters: ResourceParameters {
                    dataset: dataset.dataset.clone(),
                    swmr: dataset.swmr,
                    multiplier: dataset.multiplier,
                    chunk_shape: dataset.chunk_shape.clone(),
                },
            },
            last_emitted: 0,
            datum_count: 0,
        }
    }

    /// The resource document.
    pub fn resource(&self) -> &StreamResource {
        &self.resource
    }

    /// End of the last announced range.
    pub fn last_emitted(&self) -> u64 {
        self.last_emitted
    }

    /// Datum for `[last_emitted, indices_written)`, advancing the cursor.
    pub fn compose_datum(&mut self, indices_written: u64) -> Option<StreamDatum> {
        if indices_written <= self.last_emitted {
            return None;
        }
        let datum = StreamDatum {
            uid: format!("{}/{}", self.resource.uid, self.datum_count),
            resource_uid: self.resource.uid.clone(),
            index_range: IndexRange {
                start: self.last_emitted,
                stop: indices_written,
            },
        };
        self.last_emitted = indices_written;
        self.datum_count += 1;
        Some(datum)
    }
}

/// `file://` URI for a local path.
pub fn file_uri(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    if text.starts_with('/') {
        format!("file://localhost{text}")
    } else {
        format!("file://localhost/{text}")
    }
}

/// Resource and datum bookkeeping for one HDF5 file.
#[derive(Debug, Clone)]
pub struct HdfDocumentComposer {
    uri: String,
    bundles: Vec<StreamResourceBundle>,
    resources_emitted: bool,
}

impl HdfDocumentComposer {
    /// Composer for `datasets` in the file at `path`.
    pub fn new(path: &Path, datasets: &[HdfDataset]) -> Self {
        let uri = file_uri(path);
        let bundles = datasets
            .iter()
            .map(|dataset| StreamResourceBundle::new(&uri, dataset))
            .collect();
        Self {
            uri,
            bundles,
            resources_emitted: false,
        }
    }

    /// URI of the file.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Per-dataset bundles.
    pub fn bundles(&self) -> &[StreamResourceBundle] {
        &self.bundles
    }

    /// Documents announcing everything up to `indices_written`.
    ///
    /// The first call with a nonzero index emits every resource first.
    pub fn make_stream_docs(&mut self, indices_written: u64) -> Vec<StreamAsset> {
        let mut docs = Vec::new();
        if indices_written == 0 {
            return docs;
        }
        if !self.resources_emitted {
            docs.extend(
                self.bundles
                    .iter()
                    .map(|b| StreamAsset::StreamResource(b.resource.clone())),
            );
            self.resources_emitted = true;
        }
        docs.extend(
            self.bundles
                .iter_mut()
                .filter_map(|b| b.compose_datum(indices_written))
                .map(StreamAsset::StreamDatum),
        );
        docs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn composer() -> HdfDocumentComposer {
        HdfDocumentComposer::new(
            &PathBuf::from("/data/scan/det.h5"),
            &[
                HdfDataset::new("det", "/entry/data/data", vec![10, 20]).with_dtype("<u2"),
                HdfDataset::new("det-sum", "/entry/instrument/NDAttributes/sum", vec![]),
            ],
        )
    }

    fn datum_ranges(docs: &[StreamAsset], data_key_uid: &str) -> Vec<(u64, u64)> {
        docs.iter()
            .filter_map(|d| match d {
                StreamAsset::StreamDatum(datum) if datum.resource_uid == data_key_uid => {
                    Some((datum.index_range.start, datum.index_range.stop))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn polling_yields_gap_free_ranges() {
        let mut composer = composer();
        let uid = composer.bundles()[0].resource().uid.clone();
        let mut all = Vec::new();
        for written in [0, 0, 3, 3, 5] {
            all.extend(composer.make_stream_docs(written));
        }
        assert_eq!(datum_ranges(&all, &uid), vec![(0, 3), (3, 5)]);
        let resources = all
            .iter()
            .filter(|d| matches!(d, StreamAsset::StreamResource(_)))
            .count();
        assert_eq!(resources, 2);
        // Resources precede the first datum.
        assert!(matches!(all[0], StreamAsset::StreamResource(_)));
        assert!(matches!(all[1], StreamAsset::StreamResource(_)));
    }

    #[test]
    fn resource_parameters() {
        let mut composer = composer();
        let docs = composer.make_stream_docs(1);
        let StreamAsset::StreamResource(resource) = &docs[0] else {
            panic!("expected a resource first");
        };
        assert_eq!(resource.uri, "file://localhost/data/scan/det.h5");
        assert_eq!(resource.mimetype, HDF5_MIMETYPE);
        assert_eq!(resource.parameters.dataset, "/entry/data/data");
        assert_eq!(resource.parameters.chunk_shape, vec![1, 10, 20]);
        assert!(resource.parameters.swmr);
    }

    #[test]
    fn datum_uids_are_sequential() {
        let mut composer = composer();
        let uid = composer.bundles()[0].resource().uid.clone();
        let first = composer.make_stream_docs(2);
        let second = composer.make_stream_docs(4);
        let uids: Vec<String> = first
            .iter()
            .chain(second.iter())
            .filter_map(|d| match d {
                StreamAsset::StreamDatum(datum) if datum.resource_uid == uid => {
                    Some(datum.uid.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(uids, vec![format!("{uid}/0"), format!("{uid}/1")]);
    }

    #[test]
    fn serializes_with_document_name() {
        let mut composer = composer();
        let docs = composer.make_stream_docs(1);
        let json = serde_json::to_value(&docs[2]).unwrap();
        assert_eq!(json["name"], "stream_datum");
        assert_eq!(json["doc"]["index_range"]["start"], 0);
        assert_eq!(json["doc"]["index_range"]["stop"], 1);
    }

    proptest! {
        #[test]
        fn datum_ranges_tile_the_written_interval(steps in prop::collection::vec(0u64..20, 1..30)) {
            let mut composer = composer();
            let uid = composer.bundles()[0].resource().uid.clone();
            let mut written = 0u64;
            let mut docs = Vec::new();
            for step in steps {
                written += step;
                docs.extend(composer.make_stream_docs(written));
                // Repeated polls never add anything.
                prop_assert!(composer.make_stream_docs(written).is_empty());
            }

            let ranges = datum_ranges(&docs, &uid);
            let mut cursor = 0;
            for (start, stop) in &ranges {
                prop_assert_eq!(*start, cursor);
                prop_assert!(stop > start);
                cursor = *stop;
            }
            prop_assert_eq!(cursor, written);

            let resources = docs.iter().filter(|d| matches!(d, StreamAsset::StreamResource(_))).count();
            prop_assert_eq!(resources, if written > 0 { 2 } else { 0 });
        }
    }
}
