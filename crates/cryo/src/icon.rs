//! Embedding a Windows icon into a PE base stub
//!
//! The stub's resource tree is read, its `RT_ICON` and `RT_GROUP_ICON`
//! resources are replaced with the images of the `.ico` file, and the
//! rebuilt tree is written into a new `.rsrc` section appended to the image.
//! The resource data directory is pointed at the new section; the old
//! section is renamed `.orsrc` and left in place.

use std::fmt::Write as _;

use goblin::Hint;
use thiserror::Error;

const RT_ICON: u32 = 3;
const RT_GROUP_ICON: u32 = 14;
const LANG_NEUTRAL: u32 = 0;
const RESOURCE_DIRECTORY: usize = 2;
const CERTIFICATE_DIRECTORY: usize = 4;
const SECTION_HEADER_SIZE: usize = 40;
/// IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ
const RSRC_CHARACTERISTICS: u32 = 0x4000_0040;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IconError {
    #[error("{format} executables carry no icon resources")]
    NotPe { format: &'static str },
    #[error("invalid icon file: {0}")]
    InvalidIcon(String),
    #[error("cannot rewrite PE image: {0}")]
    Layout(String),
}

fn layout_error(message: impl Into<String>) -> IconError {
    IconError::Layout(message.into())
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// `None` when the aligned value does not fit in 32 bits
fn align_up(value: u32, alignment: u32) -> Option<u32> {
    if alignment == 0 {
        Some(value)
    } else {
        value.checked_next_multiple_of(alignment)
    }
}

/// One image of an `.ico` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconImage {
    pub width: u8,
    pub height: u8,
    pub color_count: u8,
    pub planes: u16,
    pub bit_count: u16,
    pub data: Vec<u8>,
}

/// Parse the images of an `.ico` file
pub fn parse_ico(ico: &[u8]) -> Result<Vec<IconImage>, IconError> {
    let invalid = |message: &str| IconError::InvalidIcon(message.to_owned());
    if read_u16(ico, 0) != Some(0) || read_u16(ico, 2) != Some(1) {
        return Err(invalid("missing ICONDIR header"));
    }
    let count = read_u16(ico, 4).ok_or_else(|| invalid("truncated header"))?;
    if count == 0 {
        return Err(invalid("no images"));
    }

    (0..usize::from(count))
        .map(|index| {
            let entry = 6 + index * 16;
            let header = ico
                .get(entry..entry + 16)
                .ok_or_else(|| invalid("truncated directory"))?;
            let size = read_u32(header, 8).unwrap_or(0) as usize;
            let offset = read_u32(header, 12).unwrap_or(0) as usize;
            let data = ico
                .get(offset..offset.saturating_add(size))
                .filter(|d| !d.is_empty())
                .ok_or_else(|| invalid("image data out of bounds"))?;
            Ok(IconImage {
                width: header[0],
                height: header[1],
                color_count: header[2],
                planes: read_u16(header, 4).unwrap_or(0),
                bit_count: read_u16(header, 6).unwrap_or(0),
                data: data.to_vec(),
            })
        })
        .collect()
}

/// RT_GROUP_ICON payload referencing icons `1..=images.len()`
fn group_icon_data(images: &[IconImage]) -> Vec<u8> {
    let mut data = Vec::with_capacity(6 + images.len() * 14);
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend_from_slice(&(images.len() as u16).to_le_bytes());
    for (index, image) in images.iter().enumerate() {
        data.extend_from_slice(&[image.width, image.height, image.color_count, 0]);
        data.extend_from_slice(&image.planes.to_le_bytes());
        data.extend_from_slice(&image.bit_count.to_le_bytes());
        data.extend_from_slice(&(image.data.len() as u32).to_le_bytes());
        data.extend_from_slice(&(index as u16 + 1).to_le_bytes());
    }
    data
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ResourceId {
    // Named entries sort before numeric ones
    Name(Vec<u16>),
    Id(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ResourceNode {
    Dir(Vec<ResourceEntry>),
    Data { data: Vec<u8>, code_page: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourceEntry {
    id: ResourceId,
    node: ResourceNode,
}

#[derive(Debug, Clone)]
struct Section {
    header_offset: usize,
    virtual_size: u32,
    virtual_address: u32,
    raw_size: u32,
    raw_pointer: u32,
}

impl Section {
    fn contains_rva(&self, rva: u32) -> bool {
        let span = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && rva - self.virtual_address < span
    }
}

/// Header offsets of a PE image
#[derive(Debug)]
struct PeLayout {
    coff: usize,
    opt: usize,
    section_table: usize,
    section_alignment: u32,
    file_alignment: u32,
    size_of_headers: u32,
    data_directories: usize,
    data_directory_count: u32,
    sections: Vec<Section>,
}

impl PeLayout {
    fn read(image: &[u8]) -> Result<Self, IconError> {
        let truncated = || layout_error("truncated headers");
        let pe = read_u32(image, 0x3c).ok_or_else(truncated)? as usize;
        if image.get(pe..pe + 4) != Some(b"PE\0\0".as_slice()) {
            return Err(layout_error("missing PE signature"));
        }
        let coff = pe + 4;
        let section_count = read_u16(image, coff + 2).ok_or_else(truncated)?;
        let optional_size = read_u16(image, coff + 16).ok_or_else(truncated)?;
        let opt = coff + 20;
        let (data_directories, count_offset) = match read_u16(image, opt) {
            Some(0x10b) => (opt + 96, opt + 92),
            Some(0x20b) => (opt + 112, opt + 108),
            _ => return Err(layout_error("unknown optional header magic")),
        };
        let section_table = opt + usize::from(optional_size);

        let sections = (0..usize::from(section_count))
            .map(|index| {
                let header_offset = section_table + index * SECTION_HEADER_SIZE;
                Ok(Section {
                    header_offset,
                    virtual_size: read_u32(image, header_offset + 8).ok_or_else(truncated)?,
                    virtual_address: read_u32(image, header_offset + 12).ok_or_else(truncated)?,
                    raw_size: read_u32(image, header_offset + 16).ok_or_else(truncated)?,
                    raw_pointer: read_u32(image, header_offset + 20).ok_or_else(truncated)?,
                })
            })
            .collect::<Result<Vec<_>, IconError>>()?;

        Ok(Self {
            coff,
            opt,
            section_table,
            section_alignment: read_u32(image, opt + 32).ok_or_else(truncated)?,
            file_alignment: read_u32(image, opt + 36).ok_or_else(truncated)?,
            size_of_headers: read_u32(image, opt + 60).ok_or_else(truncated)?,
            data_directories,
            data_directory_count: read_u32(image, count_offset).ok_or_else(truncated)?,
            sections,
        })
    }

    fn data_directory(&self, image: &[u8], index: usize) -> Option<(u32, u32)> {
        if index >= self.data_directory_count as usize {
            return None;
        }
        let offset = self.data_directories + index * 8;
        Some((read_u32(image, offset)?, read_u32(image, offset + 4)?))
    }

    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        self.sections
            .iter()
            .find(|s| s.contains_rva(rva))
            .and_then(|s| (rva - s.virtual_address).checked_add(s.raw_pointer))
            .map(|offset| offset as usize)
    }
}

struct TreeReader<'a> {
    image: &'a [u8],
    layout: &'a PeLayout,
    base: usize,
}

impl TreeReader<'_> {
    fn directory(&self, offset: usize, depth: usize) -> Result<Vec<ResourceEntry>, IconError> {
        if depth > 3 {
            return Err(layout_error("resource tree nested too deeply"));
        }
        let at = self.base + offset;
        let bad = || layout_error("resource directory out of bounds");
        let named = read_u16(self.image, at + 12).ok_or_else(bad)?;
        let ids = read_u16(self.image, at + 14).ok_or_else(bad)?;

        (0..usize::from(named) + usize::from(ids))
            .map(|index| {
                let entry = at + 16 + index * 8;
                let name_field = read_u32(self.image, entry).ok_or_else(bad)?;
                let data_field = read_u32(self.image, entry + 4).ok_or_else(bad)?;
                let id = if name_field & 0x8000_0000 == 0 {
                    ResourceId::Id(name_field)
                } else {
                    self.name((name_field & 0x7fff_ffff) as usize)?
                };
                let node = if data_field & 0x8000_0000 == 0 {
                    self.data(data_field as usize)?
                } else {
                    ResourceNode::Dir(self.directory((data_field & 0x7fff_ffff) as usize, depth + 1)?)
                };
                Ok(ResourceEntry { id, node })
            })
            .collect()
    }

    fn name(&self, offset: usize) -> Result<ResourceId, IconError> {
        let at = self.base + offset;
        let bad = || layout_error("resource name out of bounds");
        let length = read_u16(self.image, at).ok_or_else(bad)?;
        (0..usize::from(length))
            .map(|i| read_u16(self.image, at + 2 + i * 2).ok_or_else(bad))
            .collect::<Result<Vec<_>, _>>()
            .map(ResourceId::Name)
    }

    fn data(&self, offset: usize) -> Result<ResourceNode, IconError> {
        let at = self.base + offset;
        let bad = || layout_error("resource data out of bounds");
        let rva = read_u32(self.image, at).ok_or_else(bad)?;
        let size = read_u32(self.image, at + 4).ok_or_else(bad)? as usize;
        let code_page = read_u32(self.image, at + 8).ok_or_else(bad)?;
        let start = self.layout.rva_to_offset(rva).ok_or_else(bad)?;
        let end = start.checked_add(size).ok_or_else(bad)?;
        let data = self.image.get(start..end).ok_or_else(bad)?;
        Ok(ResourceNode::Data {
            data: data.to_vec(),
            code_page,
        })
    }
}

fn sort_tree(entries: &mut [ResourceEntry]) {
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    for entry in entries {
        if let ResourceNode::Dir(children) = &mut entry.node {
            sort_tree(children);
        }
    }
}

/// Serialize a resource tree for a section loaded at `section_rva`.
///
/// Layout: every directory table (breadth first), then name strings, then
/// data entries, then the data itself.
fn serialize_tree(root: &[ResourceEntry], section_rva: u32) -> Vec<u8> {
    let mut dirs: Vec<&[ResourceEntry]> = vec![root];
    let mut index = 0;
    while index < dirs.len() {
        for entry in dirs[index] {
            if let ResourceNode::Dir(children) = &entry.node {
                dirs.push(children);
            }
        }
        index += 1;
    }
    let entries = || dirs.iter().copied().flatten();

    let mut dir_offsets = Vec::with_capacity(dirs.len());
    let mut cursor = 0usize;
    for dir in &dirs {
        dir_offsets.push(cursor);
        cursor += 16 + dir.len() * 8;
    }
    let mut name_offsets = Vec::new();
    for entry in entries() {
        if let ResourceId::Name(name) = &entry.id {
            name_offsets.push(cursor);
            cursor += 2 + name.len() * 2;
        }
    }
    cursor = cursor.next_multiple_of(4);
    let mut data_entry_offsets = Vec::new();
    for entry in entries() {
        if matches!(entry.node, ResourceNode::Data { .. }) {
            data_entry_offsets.push(cursor);
            cursor += 16;
        }
    }
    let mut blob_offsets = Vec::new();
    for entry in entries() {
        if let ResourceNode::Data { data, .. } = &entry.node {
            cursor = cursor.next_multiple_of(8);
            blob_offsets.push(cursor);
            cursor += data.len();
        }
    }

    let mut out = vec![0u8; cursor];
    let (mut next_dir, mut next_name, mut next_data) = (1usize, 0usize, 0usize);
    for (dir, &offset) in dirs.iter().zip(&dir_offsets) {
        let named = dir.iter().filter(|e| matches!(e.id, ResourceId::Name(_))).count();
        write_u16(&mut out, offset + 12, named as u16);
        write_u16(&mut out, offset + 14, (dir.len() - named) as u16);

        for (slot, entry) in dir.iter().enumerate() {
            let at = offset + 16 + slot * 8;
            let name_field = match &entry.id {
                ResourceId::Id(id) => *id,
                ResourceId::Name(name) => {
                    let name_at = name_offsets[next_name];
                    next_name += 1;
                    write_u16(&mut out, name_at, name.len() as u16);
                    for (i, unit) in name.iter().enumerate() {
                        write_u16(&mut out, name_at + 2 + i * 2, *unit);
                    }
                    0x8000_0000 | name_at as u32
                }
            };
            let data_field = match &entry.node {
                ResourceNode::Dir(_) => {
                    let child = dir_offsets[next_dir];
                    next_dir += 1;
                    0x8000_0000 | child as u32
                }
                ResourceNode::Data { data, code_page } => {
                    let entry_at = data_entry_offsets[next_data];
                    let blob_at = blob_offsets[next_data];
                    next_data += 1;
                    // An overflowing end is rejected by the caller
                    write_u32(&mut out, entry_at, section_rva.wrapping_add(blob_at as u32));
                    write_u32(&mut out, entry_at + 4, data.len() as u32);
                    write_u32(&mut out, entry_at + 8, *code_page);
                    out[blob_at..blob_at + data.len()].copy_from_slice(data);
                    entry_at as u32
                }
            };
            write_u32(&mut out, at, name_field);
            write_u32(&mut out, at + 4, data_field);
        }
    }
    out
}

fn format_name(image: &[u8]) -> &'static str {
    let mut head = [0u8; 16];
    let len = image.len().min(16);
    head[..len].copy_from_slice(&image[..len]);
    match goblin::peek_bytes(&head) {
        Ok(Hint::Elf(_)) => "ELF",
        Ok(Hint::Mach(_) | Hint::MachFat(_)) => "Mach-O",
        _ => "unrecognized",
    }
}

/// Return a copy of `image` with the icons of `ico` as its icon resources
pub fn embed_icon(image: &[u8], ico: &[u8]) -> Result<Vec<u8>, IconError> {
    if image.get(..2) != Some(b"MZ".as_slice()) {
        return Err(IconError::NotPe {
            format: format_name(image),
        });
    }
    let images = parse_ico(ico)?;
    let layout = PeLayout::read(image)?;

    if layout
        .data_directory(image, CERTIFICATE_DIRECTORY)
        .is_some_and(|(rva, size)| rva != 0 && size != 0)
    {
        return Err(layout_error("image is signed"));
    }
    if layout.data_directory_count as usize <= RESOURCE_DIRECTORY {
        return Err(layout_error("image has no resource data directory"));
    }

    let (old_rva, old_size) = layout
        .data_directory(image, RESOURCE_DIRECTORY)
        .unwrap_or((0, 0));
    let mut tree = if old_rva == 0 || old_size == 0 {
        Vec::new()
    } else {
        let base = layout
            .rva_to_offset(old_rva)
            .ok_or_else(|| layout_error("resource directory outside every section"))?;
        TreeReader {
            image,
            layout: &layout,
            base,
        }
        .directory(0, 0)?
    };

    tree.retain(|e| !matches!(e.id, ResourceId::Id(RT_ICON | RT_GROUP_ICON)));
    let leaf = |data: Vec<u8>| ResourceNode::Dir(vec![ResourceEntry {
        id: ResourceId::Id(LANG_NEUTRAL),
        node: ResourceNode::Data { data, code_page: 0 },
    }]);
    tree.push(ResourceEntry {
        id: ResourceId::Id(RT_ICON),
        node: ResourceNode::Dir(
            images
                .iter()
                .enumerate()
                .map(|(index, icon)| ResourceEntry {
                    id: ResourceId::Id(index as u32 + 1),
                    node: leaf(icon.data.clone()),
                })
                .collect(),
        ),
    });
    tree.push(ResourceEntry {
        id: ResourceId::Id(RT_GROUP_ICON),
        node: ResourceNode::Dir(vec![ResourceEntry {
            id: ResourceId::Id(1),
            node: leaf(group_icon_data(&images)),
        }]),
    });
    sort_tree(&mut tree);

    let new_header = layout.section_table + layout.sections.len() * SECTION_HEADER_SIZE;
    let first_raw = layout
        .sections
        .iter()
        .map(|s| s.raw_pointer)
        .filter(|&p| p != 0)
        .min()
        .unwrap_or(layout.size_of_headers);
    if new_header + SECTION_HEADER_SIZE > (layout.size_of_headers.min(first_raw)) as usize {
        return Err(layout_error("no room for another section header"));
    }

    let overflow = || layout_error("section layout exceeds 32-bit offsets");
    let sections_end = layout
        .sections
        .iter()
        .map(|s| s.virtual_address.checked_add(s.virtual_size.max(s.raw_size)))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(overflow)?
        .into_iter()
        .max();
    let section_rva = match sections_end {
        Some(end) => align_up(end, layout.section_alignment),
        None => Some(layout.section_alignment),
    }
    .ok_or_else(overflow)?;
    let resources = serialize_tree(&tree, section_rva);
    let virtual_size = u32::try_from(resources.len()).map_err(|_| overflow())?;
    let image_size = section_rva
        .checked_add(virtual_size)
        .and_then(|end| align_up(end, layout.section_alignment))
        .ok_or_else(overflow)?;
    let raw_size = align_up(virtual_size, layout.file_alignment).ok_or_else(overflow)?;
    let raw_pointer = u32::try_from(image.len())
        .ok()
        .and_then(|len| align_up(len, layout.file_alignment))
        .ok_or_else(overflow)?;
    let raw_end = raw_pointer.checked_add(raw_size).ok_or_else(overflow)?;

    let mut out = image.to_vec();
    out.resize(raw_pointer as usize, 0);
    out.extend_from_slice(&resources);
    out.resize(raw_end as usize, 0);

    // Old resource section keeps its bytes under a new name
    if old_rva != 0
        && let Some(old) = layout.sections.iter().find(|s| s.contains_rva(old_rva))
    {
        out[old.header_offset..old.header_offset + 8].copy_from_slice(b".orsrc\0\0");
    }

    let mut header = [0u8; SECTION_HEADER_SIZE];
    header[..8].copy_from_slice(b".rsrc\0\0\0");
    write_u32(&mut header, 8, virtual_size);
    write_u32(&mut header, 12, section_rva);
    write_u32(&mut header, 16, raw_size);
    write_u32(&mut header, 20, raw_pointer);
    write_u32(&mut header, 36, RSRC_CHARACTERISTICS);
    out[new_header..new_header + SECTION_HEADER_SIZE].copy_from_slice(&header);

    write_u16(&mut out, layout.coff + 2, (layout.sections.len() + 1) as u16);
    write_u32(&mut out, layout.opt + 56, image_size);
    write_u32(&mut out, layout.opt + 64, 0);
    let resource_dir = layout.data_directories + RESOURCE_DIRECTORY * 8;
    write_u32(&mut out, resource_dir, section_rva);
    write_u32(&mut out, resource_dir + 4, virtual_size);
    Ok(out)
}

/// Human-readable dump of an image's resource tree, for diagnostics
pub fn describe_resources(image: &[u8]) -> Result<String, IconError> {
    fn walk(entries: &[ResourceEntry], depth: usize, out: &mut String) {
        for entry in entries {
            let indent = "  ".repeat(depth);
            let id = match &entry.id {
                ResourceId::Id(id) => id.to_string(),
                ResourceId::Name(name) => String::from_utf16_lossy(name),
            };
            match &entry.node {
                ResourceNode::Dir(children) => {
                    let _ = writeln!(out, "{indent}{id}/");
                    walk(children, depth + 1, out);
                }
                ResourceNode::Data { data, .. } => {
                    let _ = writeln!(out, "{indent}{id}: {} bytes", data.len());
                }
            }
        }
    }

    let layout = PeLayout::read(image)?;
    let Some((rva, size)) = layout.data_directory(image, RESOURCE_DIRECTORY) else {
        return Ok(String::new());
    };
    if rva == 0 || size == 0 {
        return Ok(String::new());
    }
    let base = layout
        .rva_to_offset(rva)
        .ok_or_else(|| layout_error("resource directory outside every section"))?;
    let tree = TreeReader {
        image,
        layout: &layout,
        base,
    }
    .directory(0, 0)?;
    let mut out = String::new();
    walk(&tree, 0, &mut out);
    Ok(out)
}
