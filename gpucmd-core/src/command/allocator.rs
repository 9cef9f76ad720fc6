/*! Bump allocation of tagged command records.

Commands are written as a `u32` tag followed by the record, aligned for its
type, into blocks of at least `DEFAULT_BLOCK_SIZE` bytes. Trailing arrays are
written after the record they belong to under the reserved `ADDITIONAL_DATA`
tag. A record never straddles two blocks: when it does not fit, the current
block is closed with `END_OF_BLOCK` and a new one is started.

The reader has no type information. It must ask for exactly the types the
writer wrote, in the same order. Debug builds record the written type names
and check every read against them.
*/

use std::{
    alloc::{self, Layout},
    mem,
    ptr::{self, NonNull},
    slice,
};

pub const DEFAULT_BLOCK_SIZE: usize = 2048;
const BLOCK_ALIGNMENT: usize = 16;

/// Tag closing a block. The next command lives at the start of the next block.
pub const END_OF_BLOCK: u32 = u32::MAX;
/// Tag preceding a trailing array of the previous command.
pub const ADDITIONAL_DATA: u32 = u32::MAX - 1;

const TAG_SIZE: usize = mem::size_of::<u32>();

fn align_up(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

// Blocks are plain bytes, the records written into them are `Send`.
unsafe impl Send for Block {}

impl Block {
    fn new(size: usize) -> Self {
        let size = align_up(size.max(BLOCK_ALIGNMENT), BLOCK_ALIGNMENT);
        // Non-zero size, power of two alignment, and small enough not to overflow.
        let layout = unsafe { Layout::from_size_align_unchecked(size, BLOCK_ALIGNMENT) };
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, size },
            None => alloc::handle_alloc_error(layout),
        }
    }

    fn layout(&self) -> Layout {
        unsafe { Layout::from_size_align_unchecked(self.size, BLOCK_ALIGNMENT) }
    }

    unsafe fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    unsafe fn write_tag(&self, offset: usize, tag: u32) {
        debug_assert!(offset + TAG_SIZE <= self.size);
        unsafe { ptr::write(self.at(offset) as *mut u32, tag) }
    }

    unsafe fn read_tag(&self, offset: usize) -> u32 {
        debug_assert!(offset + TAG_SIZE <= self.size);
        unsafe { ptr::read(self.at(offset) as *const u32) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout()) }
    }
}

/// Space needed to write a tag and `size` bytes at alignment `align` into a
/// fresh block, keeping room for the closing tag.
fn required_block_size(size: usize, align: usize) -> usize {
    let data_offset = align_up(TAG_SIZE, align);
    align_up(data_offset + size, TAG_SIZE) + TAG_SIZE
}

/// Writes command records into a chain of blocks.
#[derive(Debug, Default)]
pub struct CommandAllocator {
    blocks: Vec<Block>,
    /// Write offset in the last block.
    cursor: usize,
    #[cfg(debug_assertions)]
    schema: Vec<&'static str>,
}

impl CommandAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Reserves `size` bytes at `align` behind the tag `id` and returns a pointer to them.
    fn allocate_raw(&mut self, id: u32, size: usize, align: usize) -> *mut u8 {
        assert!(
            align <= BLOCK_ALIGNMENT,
            "command alignment {} exceeds the block alignment",
            align
        );

        let fits = match self.blocks.last() {
            Some(block) => {
                let id_offset = align_up(self.cursor, TAG_SIZE);
                let data_offset = align_up(id_offset + TAG_SIZE, align);
                align_up(data_offset + size, TAG_SIZE) + TAG_SIZE <= block.size
            }
            None => false,
        };

        if !fits {
            if let Some(block) = self.blocks.last() {
                // the closing tag always has room
                unsafe { block.write_tag(align_up(self.cursor, TAG_SIZE), END_OF_BLOCK) };
            }
            let block_size = DEFAULT_BLOCK_SIZE.max(required_block_size(size, align));
            self.blocks.push(Block::new(block_size));
            self.cursor = 0;
        }

        let block = &self.blocks[self.blocks.len() - 1];
        let id_offset = align_up(self.cursor, TAG_SIZE);
        let data_offset = align_up(id_offset + TAG_SIZE, align);
        unsafe {
            block.write_tag(id_offset, id);
            self.cursor = data_offset + size;
            block.at(data_offset)
        }
    }

    /// Writes `value` as a command tagged `id`.
    pub fn allocate<T>(&mut self, id: u32, value: T) -> &mut T {
        debug_assert!(id != END_OF_BLOCK && id != ADDITIONAL_DATA);
        #[cfg(debug_assertions)]
        self.schema.push(std::any::type_name::<T>());

        let ptr = self.allocate_raw(id, mem::size_of::<T>(), mem::align_of::<T>()) as *mut T;
        unsafe {
            ptr::write(ptr, value);
            &mut *ptr
        }
    }

    /// Writes a copy of `data` as the trailing array of the previous command.
    pub fn allocate_data<T: Clone>(&mut self, data: &[T]) -> &mut [T] {
        #[cfg(debug_assertions)]
        self.schema.push(std::any::type_name::<T>());

        let size = mem::size_of::<T>() * data.len();
        let ptr = self.allocate_raw(ADDITIONAL_DATA, size, mem::align_of::<T>()) as *mut T;
        unsafe {
            for (i, item) in data.iter().enumerate() {
                ptr::write(ptr.add(i), item.clone());
            }
            slice::from_raw_parts_mut(ptr, data.len())
        }
    }

    /// Closes the last block and hands the records over to an iterator.
    pub fn finish(&mut self) -> CommandIterator {
        if let Some(block) = self.blocks.last() {
            unsafe { block.write_tag(align_up(self.cursor, TAG_SIZE), END_OF_BLOCK) };
        }
        self.cursor = 0;
        CommandIterator {
            blocks: mem::take(&mut self.blocks),
            block_index: 0,
            cursor: 0,
            data_was_destroyed: false,
            #[cfg(debug_assertions)]
            schema: mem::take(&mut self.schema),
            #[cfg(debug_assertions)]
            schema_cursor: 0,
        }
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        debug_assert!(
            self.blocks.is_empty() || std::thread::panicking(),
            "command allocator dropped without being finished"
        );
    }
}

/// Reads back the records written by a `CommandAllocator`.
#[derive(Debug, Default)]
pub struct CommandIterator {
    blocks: Vec<Block>,
    block_index: usize,
    /// Read offset in the current block.
    cursor: usize,
    data_was_destroyed: bool,
    #[cfg(debug_assertions)]
    schema: Vec<&'static str>,
    #[cfg(debug_assertions)]
    schema_cursor: usize,
}

impl CommandIterator {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[cfg(debug_assertions)]
    fn check_schema(&mut self, name: &'static str) {
        let expected = self.schema.get(self.schema_cursor).copied();
        assert_eq!(
            expected,
            Some(name),
            "command stream read out of order at position {}",
            self.schema_cursor
        );
        self.schema_cursor += 1;
    }

    fn current_block(&self) -> &Block {
        &self.blocks[self.block_index]
    }

    /// Returns the tag of the next command, or `None` at the end of the stream.
    pub fn next_command_id(&mut self) -> Option<u32> {
        loop {
            if self.block_index >= self.blocks.len() {
                return None;
            }
            let id_offset = align_up(self.cursor, TAG_SIZE);
            let id = unsafe { self.current_block().read_tag(id_offset) };
            if id == END_OF_BLOCK {
                self.block_index += 1;
                self.cursor = 0;
                continue;
            }
            debug_assert_ne!(id, ADDITIONAL_DATA, "trailing data read as a command");
            self.cursor = id_offset + TAG_SIZE;
            return Some(id);
        }
    }

    /// Returns the record following the last tag.
    ///
    /// # Safety
    ///
    /// `T` must be the type written for that tag, and the returned reference
    /// must not outlive the blocks, which are released by `reset_blocks`
    /// or when the iterator is dropped.
    pub unsafe fn next_command<'a, T>(&mut self) -> &'a mut T {
        #[cfg(debug_assertions)]
        self.check_schema(std::any::type_name::<T>());

        let data_offset = align_up(self.cursor, mem::align_of::<T>());
        self.cursor = data_offset + mem::size_of::<T>();
        unsafe { &mut *(self.current_block().at(data_offset) as *mut T) }
    }

    /// Returns the trailing array written after the last record.
    ///
    /// # Safety
    ///
    /// Same as `next_command`, with `count` equal to the written length.
    pub unsafe fn next_data<'a, T>(&mut self, count: usize) -> &'a mut [T] {
        #[cfg(debug_assertions)]
        self.check_schema(std::any::type_name::<T>());

        let mut id_offset = align_up(self.cursor, TAG_SIZE);
        let mut id = unsafe { self.current_block().read_tag(id_offset) };
        if id == END_OF_BLOCK {
            // the array did not fit behind its record
            self.block_index += 1;
            id_offset = 0;
            id = unsafe { self.current_block().read_tag(id_offset) };
        }
        debug_assert_eq!(id, ADDITIONAL_DATA, "expected trailing data");
        let data_offset = align_up(id_offset + TAG_SIZE, mem::align_of::<T>());
        self.cursor = data_offset + mem::size_of::<T>() * count;
        unsafe { slice::from_raw_parts_mut(self.current_block().at(data_offset) as *mut T, count) }
    }

    /// Rewinds to the first command.
    pub fn reset(&mut self) {
        self.block_index = 0;
        self.cursor = 0;
        #[cfg(debug_assertions)]
        {
            self.schema_cursor = 0;
        }
    }

    /// Marks every record as dropped in place. The blocks are released with the iterator.
    pub fn data_was_destroyed(&mut self) {
        self.data_was_destroyed = true;
    }
}

impl Drop for CommandIterator {
    fn drop(&mut self) {
        debug_assert!(
            self.blocks.is_empty() || self.data_was_destroyed || std::thread::panicking(),
            "command iterator dropped with live records"
        );
    }
}
