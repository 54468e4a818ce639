// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Frame to input-tensor conversion.

use framekit_core::{Frame, FrameKitError, PixelFormat, Result};

use crate::accelerator::TensorDesc;

/// Converts a decoded frame into the accelerator's input layout.
///
/// Runs on the scheduler thread only; `out` is the stream's own conversion buffer.
pub trait FrameConverter: Send {
    /// # Errors
    ///
    /// Returns `FrameKitError::Conversion` when the frame can't be converted. The failure only
    /// affects this frame.
    fn convert(&mut self, frame: &Frame, desc: &TensorDesc, out: &mut [u8]) -> Result<()>;
}

/// Nearest-neighbour resize of packed 8-bit frames into a BGR NHWC tensor.
///
/// RGB input has its channels swapped, grayscale is replicated into all three channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizeConverter;

impl FrameConverter for ResizeConverter {
    fn convert(&mut self, frame: &Frame, desc: &TensorDesc, out: &mut [u8]) -> Result<()> {
        if desc.channels != 3 || desc.is_empty() {
            return Err(FrameKitError::Conversion(format!(
                "unsupported {}x{} tensor with {} channels",
                desc.width, desc.height, desc.channels
            )));
        }
        if out.len() != desc.len() {
            return Err(FrameKitError::Conversion(format!(
                "conversion buffer holds {} bytes, tensor needs {}",
                out.len(),
                desc.len()
            )));
        }
        let (src_w, src_h) = (frame.width() as usize, frame.height() as usize);
        if src_w == 0 || src_h == 0 {
            return Err(FrameKitError::Conversion("frame has no pixels".to_string()));
        }
        let format = frame.format();
        let bpp = format.bytes_per_pixel();
        let data = frame.data();
        if data.len() != format.frame_len(frame.width(), frame.height()) {
            return Err(FrameKitError::Conversion(format!(
                "frame data is {} bytes, {src_w}x{src_h} {format:?} needs {}",
                data.len(),
                format.frame_len(frame.width(), frame.height())
            )));
        }

        let (dst_w, dst_h) = (desc.width as usize, desc.height as usize);
        for (y, row) in out.chunks_exact_mut(dst_w * 3).enumerate() {
            let src_row = (y * src_h / dst_h) * src_w;
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let at = (src_row + x * src_w / dst_w) * bpp;
                let src = &data[at..at + bpp];
                match format {
                    PixelFormat::Bgr24 => px.copy_from_slice(src),
                    PixelFormat::Rgb24 => {
                        px[0] = src[2];
                        px[1] = src[1];
                        px[2] = src[0];
                    },
                    PixelFormat::Gray8 => px.fill(src[0]),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use framekit_core::{SlotMode, StreamSlot};

    fn with_frame(
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
        check: impl FnOnce(&Frame),
    ) {
        let slot = StreamSlot::new(0, SlotMode::NonBlocking);
        let mut frame = slot.try_acquire_for_produce(0).unwrap();
        frame.resize(width, height, format);
        frame.data_mut().copy_from_slice(pixels);
        check(&frame);
        slot.abort_produce(0, frame);
    }

    #[test]
    fn identity_size_copies_bgr() {
        let pixels: Vec<u8> = (0..12).collect();
        with_frame(2, 2, PixelFormat::Bgr24, &pixels, |frame| {
            let desc = TensorDesc::bgr(2, 2);
            let mut out = vec![0; desc.len()];
            ResizeConverter.convert(frame, &desc, &mut out).unwrap();
            assert_eq!(out, pixels);
        });
    }

    #[test]
    fn rgb_is_swapped_and_upscaled() {
        with_frame(1, 1, PixelFormat::Rgb24, &[1, 2, 3], |frame| {
            let desc = TensorDesc::bgr(2, 2);
            let mut out = vec![0; desc.len()];
            ResizeConverter.convert(frame, &desc, &mut out).unwrap();
            assert_eq!(out, [3u8, 2, 1].repeat(4));
        });
    }

    #[test]
    fn gray_is_replicated_and_downscaled() {
        // 4x2 gray, keep every second column.
        with_frame(4, 2, PixelFormat::Gray8, &[10, 11, 12, 13, 20, 21, 22, 23], |frame| {
            let desc = TensorDesc::bgr(2, 1);
            let mut out = vec![0; desc.len()];
            ResizeConverter.convert(frame, &desc, &mut out).unwrap();
            assert_eq!(out, [10u8, 10, 10, 12, 12, 12]);
        });
    }

    #[test]
    fn empty_frame_is_a_conversion_error() {
        let slot = StreamSlot::new(0, SlotMode::NonBlocking);
        let frame = slot.try_acquire_for_produce(0).unwrap();
        let desc = TensorDesc::bgr(2, 2);
        let mut out = vec![0; desc.len()];
        let err = ResizeConverter.convert(&frame, &desc, &mut out).unwrap_err();
        assert!(matches!(err, FrameKitError::Conversion(_)));
        assert!(!err.is_fatal());
        slot.abort_produce(0, frame);
    }
}
