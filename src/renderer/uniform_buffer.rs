//! Per-layer uniform buffer.
//!
//! Uniform blocks for one frame are staged on the CPU at 256-byte aligned
//! offsets and uploaded in one write. The GPU buffer is reused across
//! frames and only recreated when it has to grow; bind groups keyed by the
//! buffer id then miss and are rebuilt.

use bytemuck::Pod;

use crate::errors::Result;
use crate::hal::{BindingResource, BufferDesc, BufferId, RenderBackend};

/// Minimum uniform buffer offset alignment guaranteed by every backend.
pub const UNIFORM_ALIGNMENT: u64 = 256;

/// A range inside the uploaded buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UniformSlice {
    pub offset: u64,
    pub size: u64,
}

pub struct UniformBuffer {
    label: &'static str,
    buffer: Option<(BufferId, u64)>,
    staging: Vec<u8>,
    recreated: u32,
}

impl UniformBuffer {
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            buffer: None,
            staging: Vec::new(),
            recreated: 0,
        }
    }

    /// Starts staging a new frame.
    pub fn begin(&mut self) {
        self.staging.clear();
    }

    pub fn push(&mut self, bytes: &[u8]) -> UniformSlice {
        let offset = (self.staging.len() as u64).next_multiple_of(UNIFORM_ALIGNMENT);
        self.staging.resize(offset as usize, 0);
        self.staging.extend_from_slice(bytes);
        UniformSlice {
            offset,
            size: bytes.len() as u64,
        }
    }

    pub fn push_pod<T: Pod>(&mut self, value: &T) -> UniformSlice {
        self.push(bytemuck::bytes_of(value))
    }

    /// Uploads the staged bytes, growing the GPU buffer when needed.
    pub fn upload(&mut self, backend: &mut dyn RenderBackend) -> Result<Option<BufferId>> {
        if self.staging.is_empty() {
            return Ok(self.buffer.map(|(id, _)| id));
        }
        let needed = self.staging.len() as u64;
        let id = match self.buffer {
            Some((id, capacity)) if capacity >= needed => id,
            previous => {
                let capacity = needed.next_power_of_two().max(4 * UNIFORM_ALIGNMENT);
                let id = backend.create_buffer(
                    &BufferDesc {
                        label: self.label,
                        size: capacity,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    },
                    None,
                )?;
                if let Some((old, _)) = previous {
                    log::debug!("{} grown to {capacity} bytes", self.label);
                    backend.destroy_buffer(old);
                    self.recreated += 1;
                }
                self.buffer = Some((id, capacity));
                id
            }
        };
        backend.write_buffer(id, 0, &self.staging)?;
        Ok(Some(id))
    }

    /// Binding for `slice`; `None` before the first upload.
    #[must_use]
    pub fn binding(&self, slice: UniformSlice) -> Option<BindingResource> {
        self.buffer.map(|(buffer, _)| BindingResource::Buffer {
            buffer,
            offset: slice.offset,
            size: Some(slice.size),
        })
    }

    #[must_use]
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer.map(|(id, _)| id)
    }

    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    /// Times the GPU buffer was replaced by a larger one.
    #[must_use]
    pub fn recreated_count(&self) -> u32 {
        self.recreated
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some((id, _)) = self.buffer.take() {
            backend.destroy_buffer(id);
        }
        self.staging.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HeadlessBackend;

    #[test]
    fn test_slices_are_aligned() {
        let mut uniforms = UniformBuffer::new("test");
        uniforms.begin();
        let a = uniforms.push(&[1u8; 16]);
        let b = uniforms.push(&[2u8; 300]);
        let c = uniforms.push(&[3u8; 4]);
        assert_eq!((a.offset, b.offset, c.offset), (0, 256, 768));
        assert_eq!(b.size, 300);
    }

    #[test]
    fn test_buffer_reused_until_it_must_grow() {
        let mut backend = HeadlessBackend::new();
        let mut uniforms = UniformBuffer::new("test");

        uniforms.begin();
        uniforms.push(&[0u8; 64]);
        let first = uniforms.upload(&mut backend).unwrap().unwrap();

        uniforms.begin();
        uniforms.push(&[0u8; 64]);
        assert_eq!(uniforms.upload(&mut backend).unwrap(), Some(first));

        uniforms.begin();
        for _ in 0..8 {
            uniforms.push(&[0u8; 64]);
        }
        let grown = uniforms.upload(&mut backend).unwrap().unwrap();
        assert_ne!(first, grown);
        assert_eq!(uniforms.recreated_count(), 1);
        assert_eq!(backend.live_buffers(), 1);
    }

    #[test]
    fn test_upload_writes_staged_bytes() {
        let mut backend = HeadlessBackend::new();
        let mut uniforms = UniformBuffer::new("test");
        uniforms.begin();
        uniforms.push(&[7u8; 4]);
        let slice = uniforms.push(&[9u8; 4]);
        let id = uniforms.upload(&mut backend).unwrap().unwrap();

        let contents = backend.buffer_contents(id).unwrap();
        let start = slice.offset as usize;
        assert_eq!(&contents[..4], &[7; 4]);
        assert_eq!(&contents[start..start + 4], &[9; 4]);
    }
}
