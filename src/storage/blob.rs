use anyhow::{Error, Result};

use super::pager::Pager;
use crate::arena::Arena;
use crate::common::{PageNo, PAGE_SIZE};

// Segment header: self index, next segment, payload size, flags.
const HDR_INDEX: usize = 0;
const HDR_NEXT: usize = 4;
const HDR_SIZE: usize = 8;
const HDR_FLAGS: usize = 10;
pub const BLOB_HEADER_SIZE: usize = 12;
pub const BLOB_DATA_PER_PAGE: usize = PAGE_SIZE - BLOB_HEADER_SIZE;

/// Writes a byte sequence as a chain of blob segment pages and returns the
/// first page index. Empty input stores nothing and returns 0.
pub fn create(pager: &mut Pager, data: &[u8]) -> Result<PageNo> {
    if data.is_empty() {
        return Ok(0);
    }

    let mut first = 0u32;
    let mut prev: Option<PageNo> = None;
    for chunk in data.chunks(BLOB_DATA_PER_PAGE) {
        let page_no = pager.allocate_page()?;
        if first == 0 {
            first = page_no;
        }
        let page = pager.page_mut(page_no)?;
        page.fill(0);
        page[HDR_INDEX..HDR_INDEX + 4].copy_from_slice(&page_no.to_le_bytes());
        page[HDR_SIZE..HDR_SIZE + 2].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
        page[HDR_FLAGS..HDR_FLAGS + 2].copy_from_slice(&0u16.to_le_bytes());
        page[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);

        if let Some(prev_no) = prev {
            let prev_page = pager.page_mut(prev_no)?;
            prev_page[HDR_NEXT..HDR_NEXT + 4].copy_from_slice(&page_no.to_le_bytes());
        }
        prev = Some(page_no);
    }
    Ok(first)
}

/// Total payload length of the chain starting at `first_page`.
pub fn size(pager: &mut Pager, first_page: PageNo) -> Result<usize> {
    let mut total = 0usize;
    let mut page_no = first_page;
    while page_no != 0 {
        let page = pager.page(page_no)?;
        total += segment_size(page);
        page_no = segment_next(page);
    }
    Ok(total)
}

/// Reassembles the chain into one contiguous arena allocation through the
/// stream writer; the slice lives as long as the arena.
pub fn read_full<'a>(
    pager: &mut Pager,
    arena: &'a mut Arena,
    first_page: PageNo,
) -> Result<&'a [u8]> {
    let mut stream = arena.begin_stream();
    let mut page_no = first_page;
    while page_no != 0 {
        let (chunk, next) = {
            let page = pager.page(page_no)?;
            let size = segment_size(page);
            if size > BLOB_DATA_PER_PAGE {
                return Err(Error::msg(format!(
                    "blob segment {} claims {} payload bytes",
                    page_no, size
                )));
            }
            (
                page[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + size].to_vec(),
                segment_next(page),
            )
        };
        arena.stream_write(&mut stream, &chunk)?;
        page_no = next;
    }
    let result = arena.finish_stream(stream)?;
    Ok(result.as_slice(arena))
}

/// Frees every page of the chain.
pub fn delete(pager: &mut Pager, first_page: PageNo) -> Result<()> {
    let mut page_no = first_page;
    while page_no != 0 {
        let next = segment_next(pager.page(page_no)?);
        pager.free_page(page_no)?;
        page_no = next;
    }
    Ok(())
}

fn segment_next(page: &[u8]) -> PageNo {
    u32::from_le_bytes(page[HDR_NEXT..HDR_NEXT + 4].try_into().unwrap())
}

fn segment_size(page: &[u8]) -> usize {
    u16::from_le_bytes(page[HDR_SIZE..HDR_SIZE + 2].try_into().unwrap()) as usize
}
