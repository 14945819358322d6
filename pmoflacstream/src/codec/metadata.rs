//! Plain-data view of the metadata blocks exchanged with libFLAC.
//!
//! Decoding copies blocks out of the codec's structures as soon as the
//! metadata callback fires; encoding builds owned libFLAC objects that live
//! until the encoder is finished.

use std::{mem::MaybeUninit, path::Path, slice};

use libflac_sys::*;
use serde::{Deserialize, Serialize};

use super::path_to_cstring;
use crate::error::FlacError;

/// Metadata block types defined by the FLAC format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    StreamInfo,
    Padding,
    Application,
    SeekTable,
    VorbisComment,
    CueSheet,
    Picture,
    Unknown(u32),
}

impl MetadataKind {
    pub(crate) fn from_raw(raw: FLAC__MetadataType) -> Self {
        match raw {
            FLAC__METADATA_TYPE_STREAMINFO => MetadataKind::StreamInfo,
            FLAC__METADATA_TYPE_PADDING => MetadataKind::Padding,
            FLAC__METADATA_TYPE_APPLICATION => MetadataKind::Application,
            FLAC__METADATA_TYPE_SEEKTABLE => MetadataKind::SeekTable,
            FLAC__METADATA_TYPE_VORBIS_COMMENT => MetadataKind::VorbisComment,
            FLAC__METADATA_TYPE_CUESHEET => MetadataKind::CueSheet,
            FLAC__METADATA_TYPE_PICTURE => MetadataKind::Picture,
            other => MetadataKind::Unknown(other as u32),
        }
    }

    pub(crate) fn to_raw(self) -> FLAC__MetadataType {
        match self {
            MetadataKind::StreamInfo => FLAC__METADATA_TYPE_STREAMINFO,
            MetadataKind::Padding => FLAC__METADATA_TYPE_PADDING,
            MetadataKind::Application => FLAC__METADATA_TYPE_APPLICATION,
            MetadataKind::SeekTable => FLAC__METADATA_TYPE_SEEKTABLE,
            MetadataKind::VorbisComment => FLAC__METADATA_TYPE_VORBIS_COMMENT,
            MetadataKind::CueSheet => FLAC__METADATA_TYPE_CUESHEET,
            MetadataKind::Picture => FLAC__METADATA_TYPE_PICTURE,
            MetadataKind::Unknown(raw) => raw as FLAC__MetadataType,
        }
    }
}

/// Content of the STREAMINFO block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub min_block_size: u32,
    pub max_block_size: u32,
    pub min_frame_size: u32,
    pub max_frame_size: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    /// 0 when the encoder did not know the length.
    pub total_samples: u64,
    pub md5: [u8; 16],
}

/// A metadata block, decoded or to be written before the audio frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataBlock {
    #[serde(skip_deserializing)]
    StreamInfo(StreamInfo),
    Padding {
        length: u32,
    },
    Application {
        id: [u8; 4],
        #[serde(default)]
        data: Vec<u8>,
    },
    VorbisComment {
        /// Kept on the block as given. The libFLAC encoder stamps its own
        /// vendor string into the stream it writes.
        #[serde(default)]
        vendor: String,
        #[serde(default)]
        comments: Vec<(String, String)>,
    },
    #[serde(skip_deserializing)]
    Other { kind: MetadataKind, length: u32 },
}

impl MetadataBlock {
    pub fn kind(&self) -> MetadataKind {
        match self {
            MetadataBlock::StreamInfo(_) => MetadataKind::StreamInfo,
            MetadataBlock::Padding { .. } => MetadataKind::Padding,
            MetadataBlock::Application { .. } => MetadataKind::Application,
            MetadataBlock::VorbisComment { .. } => MetadataKind::VorbisComment,
            MetadataBlock::Other { kind, .. } => *kind,
        }
    }

    /// Convenience constructor for a tag block.
    pub fn tags<K, V>(comments: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        MetadataBlock::VorbisComment {
            vendor: String::new(),
            comments: comments
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Copies a block out of libFLAC.
    ///
    /// # Safety
    ///
    /// `raw` must point to a valid block for the duration of the call.
    pub(crate) unsafe fn from_raw(raw: *const FLAC__StreamMetadata) -> Self {
        let block = unsafe { &*raw };
        let kind = MetadataKind::from_raw(block.type_);
        match kind {
            MetadataKind::StreamInfo => {
                let info = unsafe { &block.data.stream_info };
                MetadataBlock::StreamInfo(StreamInfo {
                    min_block_size: info.min_blocksize,
                    max_block_size: info.max_blocksize,
                    min_frame_size: info.min_framesize,
                    max_frame_size: info.max_framesize,
                    sample_rate: info.sample_rate,
                    channels: info.channels as u8,
                    bits_per_sample: info.bits_per_sample as u8,
                    total_samples: info.total_samples,
                    md5: info.md5sum,
                })
            }
            MetadataKind::Padding => MetadataBlock::Padding {
                length: block.length,
            },
            MetadataKind::Application => {
                let app = unsafe { &block.data.application };
                // The 4-byte id is counted in the block length.
                let len = (block.length as usize).saturating_sub(4);
                let data = unsafe { copy_raw(app.data, len) };
                MetadataBlock::Application { id: app.id, data }
            }
            MetadataKind::VorbisComment => {
                let vc = unsafe { &block.data.vorbis_comment };
                let vendor = unsafe { entry_to_string(&vc.vendor_string) };
                let entries: &[FLAC__StreamMetadata_VorbisComment_Entry] =
                    if vc.comments.is_null() || vc.num_comments == 0 {
                        &[]
                    } else {
                        unsafe { slice::from_raw_parts(vc.comments, vc.num_comments as usize) }
                    };
                let comments = entries
                    .iter()
                    .map(|entry| {
                        let text = unsafe { entry_to_string(entry) };
                        match text.split_once('=') {
                            Some((name, value)) => (name.to_string(), value.to_string()),
                            None => (text, String::new()),
                        }
                    })
                    .collect();
                MetadataBlock::VorbisComment { vendor, comments }
            }
            _ => MetadataBlock::Other {
                kind,
                length: block.length,
            },
        }
    }

    /// Builds an owned libFLAC object for the encoder.
    pub(crate) fn to_raw(&self) -> Result<OwnedMetadata, FlacError> {
        let object = OwnedMetadata::new(self.kind())?;
        let raw = object.as_ptr();
        match self {
            MetadataBlock::Padding { length } => unsafe {
                (*raw).length = *length;
            },
            MetadataBlock::Application { id, data } => {
                let mut data = data.clone();
                let ok = unsafe {
                    (*raw).data.application.id = *id;
                    FLAC__metadata_object_application_set_data(
                        raw,
                        data.as_mut_ptr(),
                        data.len() as u32,
                        1,
                    )
                };
                if ok == 0 {
                    return Err(FlacError::InvalidOption(
                        "could not attach application data".into(),
                    ));
                }
            }
            MetadataBlock::VorbisComment { vendor, comments } => {
                if !vendor.is_empty() {
                    let mut text = vendor.clone().into_bytes();
                    let entry = FLAC__StreamMetadata_VorbisComment_Entry {
                        length: text.len() as u32,
                        entry: text.as_mut_ptr(),
                    };
                    let ok = unsafe {
                        FLAC__metadata_object_vorbiscomment_set_vendor_string(raw, entry, 1)
                    };
                    if ok == 0 {
                        return Err(FlacError::InvalidOption(
                            "could not set vorbis comment vendor".into(),
                        ));
                    }
                }
                for (name, value) in comments {
                    validate_field_name(name)?;
                    let mut text = format!("{name}={value}").into_bytes();
                    let entry = FLAC__StreamMetadata_VorbisComment_Entry {
                        length: text.len() as u32,
                        entry: text.as_mut_ptr(),
                    };
                    // copy = true: libFLAC duplicates the bytes, `text` stays ours.
                    let ok = unsafe { FLAC__metadata_object_vorbiscomment_append_comment(raw, entry, 1) };
                    if ok == 0 {
                        return Err(FlacError::InvalidOption(format!(
                            "could not append vorbis comment {name}"
                        )));
                    }
                }
            }
            MetadataBlock::StreamInfo(_) | MetadataBlock::Other { .. } => {
                return Err(FlacError::InvalidOption(format!(
                    "{:?} blocks cannot be written by the encoder",
                    self.kind()
                )));
            }
        }
        Ok(object)
    }
}

/// Reads STREAMINFO back from a finished native FLAC file.
///
/// Returns `None` when libFLAC cannot find it (Ogg FLAC files included).
pub(crate) fn read_stream_info(path: &Path) -> Result<Option<StreamInfo>, FlacError> {
    let filename = path_to_cstring(path)?;
    let mut block = MaybeUninit::<FLAC__StreamMetadata>::zeroed();
    let ok = unsafe { FLAC__metadata_get_streaminfo(filename.as_ptr(), block.as_mut_ptr()) };
    if ok == 0 {
        return Ok(None);
    }
    match unsafe { MetadataBlock::from_raw(block.as_ptr()) } {
        MetadataBlock::StreamInfo(info) => Ok(Some(info)),
        _ => Ok(None),
    }
}

/// Rejects names the Vorbis comment format does not allow.
pub(crate) fn validate_field_name(name: &str) -> Result<(), FlacError> {
    let valid = !name.is_empty() && name.bytes().all(|b| (0x20..=0x7D).contains(&b) && b != b'=');
    if valid {
        Ok(())
    } else {
        Err(FlacError::InvalidOption(format!(
            "invalid vorbis comment field name {name:?}"
        )))
    }
}

unsafe fn copy_raw(ptr: *const u8, len: usize) -> Vec<u8> {
    if ptr.is_null() || len == 0 {
        return Vec::new();
    }
    unsafe { slice::from_raw_parts(ptr, len) }.to_vec()
}

unsafe fn entry_to_string(entry: &FLAC__StreamMetadata_VorbisComment_Entry) -> String {
    let bytes = unsafe { copy_raw(entry.entry, entry.length as usize) };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// libFLAC metadata object owned by Rust; deleted on drop.
#[derive(Debug)]
pub(crate) struct OwnedMetadata(*mut FLAC__StreamMetadata);

// The object is only touched by the thread that owns the encoder.
unsafe impl Send for OwnedMetadata {}

impl OwnedMetadata {
    fn new(kind: MetadataKind) -> Result<Self, FlacError> {
        let ptr = unsafe { FLAC__metadata_object_new(kind.to_raw()) };
        if ptr.is_null() {
            return Err(FlacError::InvalidOption(format!(
                "libFLAC could not allocate a {kind:?} block"
            )));
        }
        Ok(Self(ptr))
    }

    pub(crate) fn as_ptr(&self) -> *mut FLAC__StreamMetadata {
        self.0
    }
}

impl Drop for OwnedMetadata {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { FLAC__metadata_object_delete(self.0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_raw() {
        for kind in [
            MetadataKind::StreamInfo,
            MetadataKind::Padding,
            MetadataKind::VorbisComment,
            MetadataKind::Picture,
        ] {
            assert_eq!(MetadataKind::from_raw(kind.to_raw()), kind);
        }
        assert_eq!(MetadataKind::from_raw(42), MetadataKind::Unknown(42));
    }

    #[test]
    fn vorbis_comment_survives_libflac_object() {
        let block = MetadataBlock::tags([("TITLE", "Test"), ("ARTIST", "Somebody")]);
        let object = block.to_raw().unwrap();
        let back = unsafe { MetadataBlock::from_raw(object.as_ptr()) };
        match back {
            MetadataBlock::VorbisComment { comments, .. } => {
                assert_eq!(
                    comments,
                    vec![
                        ("TITLE".to_string(), "Test".to_string()),
                        ("ARTIST".to_string(), "Somebody".to_string()),
                    ]
                );
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn vorbis_comment_keeps_the_vendor_string() {
        let block = MetadataBlock::VorbisComment {
            vendor: "pmoflacstream test".into(),
            comments: vec![("GENRE".into(), "Test".into())],
        };
        let object = block.to_raw().unwrap();
        assert_eq!(unsafe { MetadataBlock::from_raw(object.as_ptr()) }, block);
    }

    #[test]
    fn application_and_padding_blocks() {
        let app = MetadataBlock::Application {
            id: *b"pmo!",
            data: vec![1, 2, 3],
        };
        let object = app.to_raw().unwrap();
        assert_eq!(unsafe { MetadataBlock::from_raw(object.as_ptr()) }, app);

        let padding = MetadataBlock::Padding { length: 128 };
        let object = padding.to_raw().unwrap();
        assert_eq!(unsafe { MetadataBlock::from_raw(object.as_ptr()) }, padding);
    }

    #[test]
    fn rejects_bad_field_names_and_stream_info() {
        assert!(MetadataBlock::tags([("BAD=NAME", "x")]).to_raw().is_err());
        assert!(validate_field_name("").is_err());
        let info = MetadataBlock::StreamInfo(StreamInfo {
            min_block_size: 4096,
            max_block_size: 4096,
            min_frame_size: 0,
            max_frame_size: 0,
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
            total_samples: 0,
            md5: [0; 16],
        });
        assert!(info.to_raw().is_err());
    }
}
