//! Binary record formats.
//!
//! Every record starts with a fixed-width little-endian header encoded with
//! bincode's fixed-int layout, followed by variable-length names and keys.
//! Formats carry no version; anything that does not parse is corruption.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Chunk, DirectoryItem, FileItem, ItemId, MetaError, MetaResult, NamespaceItem, Timestamp};

/// Item records are padded to a multiple of this many bytes.
pub const ITEM_PADDING: usize = 128;
/// Address buckets are padded to a multiple of this many bytes.
pub const ADDRESS_PADDING: usize = 256;

const ITEM_TYPE_FILE: u8 = 0x0e;
const ITEM_TYPE_DIR: u8 = 0x0f;

#[derive(Serialize, Deserialize)]
struct ItemEnvelope {
    block_size: u32,
    item_size: u32,
    item_type: u8,
}

#[derive(Serialize, Deserialize)]
struct ChunkHeader {
    seek: u64,
    size: u64,
    checksum: [u8; 32],
    key_len: u16,
}

#[derive(Serialize, Deserialize)]
struct FileHeader {
    item_id: u32,
    parent_dir_id: u32,
    create_date: Timestamp,
    size: u64,
    replica_count: u8,
    name_len: u16,
    chunk_count: u32,
}

#[derive(Serialize, Deserialize)]
struct DirHeader {
    item_id: u32,
    parent_dir_id: u32,
    create_date: Timestamp,
    last_modify_date: Timestamp,
    replica_count: u8,
    name_len: u16,
}

#[derive(Serialize, Deserialize)]
struct ListHeader {
    count: u32,
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> MetaError {
    MetaError::Corruption(format!("{}: {}", what, e))
}

fn put<T: Serialize>(out: &mut Vec<u8>, header: &T) {
    bincode::serialize_into(out, header).expect("fixed-size header serializes into a Vec");
}

fn take<T: DeserializeOwned>(input: &mut &[u8], what: &str) -> MetaResult<T> {
    bincode::deserialize_from(input).map_err(|e| corrupt(what, e))
}

fn take_bytes<'a>(input: &mut &'a [u8], n: usize, what: &str) -> MetaResult<&'a [u8]> {
    if input.len() < n {
        return Err(MetaError::Corruption(format!(
            "{}: need {} bytes, have {}",
            what,
            n,
            input.len()
        )));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn take_string(input: &mut &[u8], n: usize, what: &str) -> MetaResult<String> {
    let bytes = take_bytes(input, n, what)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| corrupt(what, e))
}

fn name_len(name: &str) -> MetaResult<u16> {
    u16::try_from(name.len()).map_err(|_| MetaError::Corruption(format!("name too long: {} bytes", name.len())))
}

fn pad_to(out: &mut Vec<u8>, multiple: usize) {
    let rem = out.len() % multiple;
    if rem != 0 {
        out.resize(out.len() + multiple - rem, 0);
    }
}

/// Encodes a chunk.
pub fn encode_chunk(out: &mut Vec<u8>, chunk: &Chunk) -> MetaResult<()> {
    let key = chunk.key.as_deref().unwrap_or("");
    put(
        out,
        &ChunkHeader {
            seek: chunk.seek,
            size: chunk.size,
            checksum: chunk.checksum,
            key_len: name_len(key)?,
        },
    );
    out.extend_from_slice(key.as_bytes());
    Ok(())
}

/// Decodes a chunk, advancing `input`.
pub fn decode_chunk(input: &mut &[u8]) -> MetaResult<Chunk> {
    let hdr: ChunkHeader = take(input, "chunk header")?;
    let key = take_string(input, hdr.key_len as usize, "chunk key")?;
    Ok(Chunk {
        key: if key.is_empty() { None } else { Some(key) },
        checksum: hdr.checksum,
        seek: hdr.seek,
        size: hdr.size,
    })
}

fn encode_file(out: &mut Vec<u8>, file: &FileItem) -> MetaResult<()> {
    put(
        out,
        &FileHeader {
            item_id: file.item_id.as_u32(),
            parent_dir_id: file.parent_dir_id.as_u32(),
            create_date: file.create_date,
            size: file.size,
            replica_count: file.replica_count,
            name_len: name_len(&file.name)?,
            chunk_count: file.chunks.len() as u32,
        },
    );
    out.extend_from_slice(file.name.as_bytes());
    for chunk in &file.chunks {
        encode_chunk(out, chunk)?;
    }
    Ok(())
}

fn decode_file(input: &mut &[u8]) -> MetaResult<FileItem> {
    let hdr: FileHeader = take(input, "file header")?;
    let name = take_string(input, hdr.name_len as usize, "file name")?;
    let mut chunks = Vec::with_capacity(hdr.chunk_count.min(4096) as usize);
    for _ in 0..hdr.chunk_count {
        chunks.push(decode_chunk(input)?);
    }
    Ok(FileItem {
        item_id: ItemId::new(hdr.item_id),
        parent_dir_id: ItemId::new(hdr.parent_dir_id),
        name,
        create_date: hdr.create_date,
        size: hdr.size,
        replica_count: hdr.replica_count,
        chunks,
    })
}

fn encode_dir(out: &mut Vec<u8>, dir: &DirectoryItem) -> MetaResult<()> {
    put(
        out,
        &DirHeader {
            item_id: dir.item_id.as_u32(),
            parent_dir_id: dir.parent_dir_id.as_u32(),
            create_date: dir.create_date,
            last_modify_date: dir.last_modify_date,
            replica_count: dir.replica_count,
            name_len: name_len(&dir.name)?,
        },
    );
    out.extend_from_slice(dir.name.as_bytes());
    Ok(())
}

fn decode_dir(input: &mut &[u8]) -> MetaResult<DirectoryItem> {
    let hdr: DirHeader = take(input, "directory header")?;
    let name = take_string(input, hdr.name_len as usize, "directory name")?;
    Ok(DirectoryItem {
        item_id: ItemId::new(hdr.item_id),
        parent_dir_id: ItemId::new(hdr.parent_dir_id),
        name,
        create_date: hdr.create_date,
        last_modify_date: hdr.last_modify_date,
        replica_count: hdr.replica_count,
    })
}

/// Encodes an item record: envelope, item body, zero padding.
pub fn encode_item(item: &NamespaceItem) -> MetaResult<Vec<u8>> {
    let mut body = Vec::new();
    let item_type = match item {
        NamespaceItem::File(f) => {
            encode_file(&mut body, f)?;
            ITEM_TYPE_FILE
        }
        NamespaceItem::Directory(d) => {
            encode_dir(&mut body, d)?;
            ITEM_TYPE_DIR
        }
    };

    let mut out = Vec::with_capacity(body.len() + ITEM_PADDING);
    put(
        &mut out,
        &ItemEnvelope {
            block_size: 0,
            item_size: body.len() as u32,
            item_type,
        },
    );
    out.extend_from_slice(&body);
    pad_to(&mut out, ITEM_PADDING);
    let block_size = out.len() as u32;
    out[..4].copy_from_slice(&block_size.to_le_bytes());
    Ok(out)
}

/// Decodes an item record produced by [`encode_item`].
pub fn decode_item(data: &[u8]) -> MetaResult<NamespaceItem> {
    let mut input = data;
    let env: ItemEnvelope = take(&mut input, "item envelope")?;
    if env.block_size as usize != data.len() {
        return Err(MetaError::Corruption(format!(
            "item block size {} does not match record length {}",
            env.block_size,
            data.len()
        )));
    }
    let mut body = take_bytes(&mut input, env.item_size as usize, "item body")?;
    let item = match env.item_type {
        ITEM_TYPE_FILE => NamespaceItem::File(decode_file(&mut body)?),
        ITEM_TYPE_DIR => NamespaceItem::Directory(decode_dir(&mut body)?),
        other => {
            return Err(MetaError::Corruption(format!("unknown item type {:#04x}", other)));
        }
    };
    if !body.is_empty() {
        return Err(MetaError::Corruption(format!(
            "{} trailing bytes in item body",
            body.len()
        )));
    }
    Ok(item)
}

/// Encodes an address bucket: the ids of children sharing one name hash.
pub fn encode_id_list(ids: &[ItemId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ids.len() * 4);
    put(&mut out, &ListHeader { count: ids.len() as u32 });
    for id in ids {
        out.extend_from_slice(&id.as_u32().to_le_bytes());
    }
    pad_to(&mut out, ADDRESS_PADDING);
    out
}

/// Decodes an address bucket.
pub fn decode_id_list(data: &[u8]) -> MetaResult<Vec<ItemId>> {
    let mut input = data;
    let hdr: ListHeader = take(&mut input, "address bucket header")?;
    let body = take_bytes(&mut input, hdr.count as usize * 4, "address bucket")?;
    Ok(body
        .chunks_exact(4)
        .map(|c| ItemId::new(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect())
}

/// Encodes a directory's insertion-ordered child index of `(name_hash, id)`.
pub fn encode_children(children: &[(u32, ItemId)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + children.len() * 8);
    put(&mut out, &ListHeader { count: children.len() as u32 });
    for (hash, id) in children {
        out.extend_from_slice(&hash.to_le_bytes());
        out.extend_from_slice(&id.as_u32().to_le_bytes());
    }
    out
}

/// Decodes a child index.
pub fn decode_children(data: &[u8]) -> MetaResult<Vec<(u32, ItemId)>> {
    let mut input = data;
    let hdr: ListHeader = take(&mut input, "child index header")?;
    let body = take_bytes(&mut input, hdr.count as usize * 8, "child index")?;
    Ok(body
        .chunks_exact(8)
        .map(|c| {
            let hash = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            let id = u32::from_le_bytes([c[4], c[5], c[6], c[7]]);
            (hash, ItemId::new(id))
        })
        .collect())
}
