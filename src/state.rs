use crate::buffer::StreamBuffer;
use crate::spool::SpoolHandle;

pub(crate) struct MultipartState<S> {
    pub(crate) buffer: StreamBuffer<S>,
    pub(crate) boundary: String,
    pub(crate) stage: StreamingStage,
    pub(crate) next_part_idx: usize,
    pub(crate) total_parts: usize,
    pub(crate) file_parts: usize,
    pub(crate) buffered_bytes: usize,
    pub(crate) open_spools: Vec<SpoolHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamingStage {
    SeekingFirstBoundary,
    ReadingBoundary,
    DeterminingBoundaryType,
    ReadingTransportPadding,
    ReadingPartHeaders,
    ReadingPartBody,
    Eof,
    Failed,
}

impl<S> MultipartState<S> {
    pub(crate) fn delimiter(&self) -> Vec<u8> {
        format!("\r\n--{}", self.boundary).into_bytes()
    }

    pub(crate) fn dash_boundary(&self) -> Vec<u8> {
        format!("--{}", self.boundary).into_bytes()
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.stage, StreamingStage::Eof | StreamingStage::Failed)
    }
}
