//! BPF object templates, per-load specs and loaded objects
//!
//! An [`ObjectTemplate`] holds the compiled ELF relocatable and is never mutated. Every load
//! goes through an [`ObjectSpec`], a cheap copy of the template carrying the constants to
//! rewrite and the maps to replace, so that tweaking one load never leaks into another.

use anyhow::{Context, Result, bail};
use ::object::{Object as _, ObjectSection, ObjectSymbol};
use libbpf_rs::{Link, MapCore, Object, ObjectBuilder};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use crate::perf::{self, PerfReader, ReaderHandle};

const RODATA_SECTION: &str = ".rodata";
const MAPS_SECTION: &str = ".maps";

/// Immutable compiled BPF object
#[derive(Clone)]
pub struct ObjectTemplate {
    bytes: Arc<[u8]>,
}

impl ObjectTemplate {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        ::object::File::parse(&*bytes).context("Failed to parse BPF object")?;
        Ok(Self { bytes })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read BPF object {}", path.display()))?;
        Self::from_bytes(bytes)
            .with_context(|| format!("Invalid BPF object {}", path.display()))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the object declares a BTF-defined map called `name`
    pub fn has_map(&self, name: &str) -> bool {
        find_symbol(&self.bytes, MAPS_SECTION, name).is_some()
    }

    /// Start a new load spec from this template
    pub fn copy<'fd>(&self) -> ObjectSpec<'fd> {
        ObjectSpec {
            template: self.clone(),
            constants: Vec::new(),
            map_replacements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Constant {
    name: String,
    offset: usize,
    value: Vec<u8>,
}

/// A copy of an [`ObjectTemplate`] with load-time modifications.
///
/// Map replacements borrow the file descriptor of an existing map for as long as the spec
/// lives. The loaded object then refers to that same kernel map, not a copy of it.
pub struct ObjectSpec<'fd> {
    template: ObjectTemplate,
    constants: Vec<Constant>,
    map_replacements: Vec<(String, BorrowedFd<'fd>)>,
}

impl<'fd> ObjectSpec<'fd> {
    pub fn template(&self) -> &ObjectTemplate {
        &self.template
    }

    /// Overwrite the initial value of a `const volatile` global living in `.rodata`.
    ///
    /// `value` must have exactly the size of the variable, in native byte order.
    pub fn rewrite_constant(&mut self, name: &str, value: &[u8]) -> Result<()> {
        let Some((offset, size)) = find_symbol(self.template.bytes(), RODATA_SECTION, name)
        else {
            bail!("Constant {name} not found in {RODATA_SECTION}");
        };
        if size != value.len() {
            bail!(
                "Constant {name} has size {size}, got a value of {} bytes",
                value.len()
            );
        }

        self.constants.retain(|c| c.name != name);
        self.constants.push(Constant {
            name: name.to_owned(),
            offset,
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Make the loaded object reuse an existing map instead of creating `name`
    pub fn replace_map(&mut self, name: &str, map: BorrowedFd<'fd>) {
        self.map_replacements.retain(|(n, _)| n != name);
        self.map_replacements.push((name.to_owned(), map));
    }

    pub fn constant(&self, name: &str) -> Option<&[u8]> {
        self.constants
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_slice())
    }

    pub fn map_replacement(&self, name: &str) -> Option<BorrowedFd<'fd>> {
        self.map_replacements
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, fd)| *fd)
    }

    fn apply_constants(&self, rodata: &mut [u8]) -> Result<()> {
        for constant in &self.constants {
            let end = constant.offset + constant.value.len();
            let Some(slot) = rodata.get_mut(constant.offset..end) else {
                bail!(
                    "Constant {} is out of bounds of {RODATA_SECTION} ({} bytes)",
                    constant.name,
                    rodata.len()
                );
            };
            slot.copy_from_slice(&constant.value);
        }
        Ok(())
    }

    /// Open the object, apply the modifications and load it into the kernel
    pub fn load(&self) -> Result<LoadedObject> {
        let mut open_object = ObjectBuilder::default()
            .open_memory(self.template.bytes())
            .context("Failed to open BPF object")?;

        let mut constants_applied = self.constants.is_empty();
        for mut map in open_object.maps_mut() {
            let name = map.name().to_string_lossy().into_owned();

            if let Some(fd) = self.map_replacement(&name) {
                map.reuse_fd(fd)
                    .with_context(|| format!("Failed to replace map {name}"))?;
            }

            if !constants_applied && name.ends_with(RODATA_SECTION) {
                let rodata = map
                    .initial_value_mut()
                    .with_context(|| format!("Map {name} has no initial value"))?;
                self.apply_constants(rodata)?;
                constants_applied = true;
            }
        }
        if !constants_applied {
            bail!("BPF object has no {RODATA_SECTION} map to rewrite constants into");
        }

        let object = open_object.load().context("Failed to load BPF object")?;
        Ok(LoadedObject { object })
    }
}

/// Returns the offset and size of symbol `name` within `section`
fn find_symbol(elf: &[u8], section: &str, name: &str) -> Option<(usize, usize)> {
    let file = ::object::File::parse(elf).ok()?;

    file.symbols().find_map(|symbol| {
        if symbol.name().ok()? != name {
            return None;
        }
        let index = symbol.section_index()?;
        let symbol_section = file.section_by_index(index).ok()?;
        if symbol_section.name().ok()? != section {
            return None;
        }

        let offset = symbol.address().checked_sub(symbol_section.address())?;
        Some((usize::try_from(offset).ok()?, usize::try_from(symbol.size()).ok()?))
    })
}

/// A loaded program/map set. Dropping it releases every program and map it owns.
pub struct LoadedObject {
    object: Object,
}

impl LoadedObject {
    /// Duplicate the file descriptor of map `name`
    pub fn map_fd(&self, name: &str) -> Result<OwnedFd> {
        let map = self
            .object
            .maps()
            .find(|m| m.name() == name)
            .with_context(|| format!("BPF map {name:?} not found"))?;
        map.as_fd()
            .try_clone_to_owned()
            .with_context(|| format!("Failed to duplicate fd of map {name}"))
    }

    /// Duplicate the file descriptor of program `name`, if the object has it
    pub fn program_fd(&self, name: &str) -> Result<Option<OwnedFd>> {
        let Some(prog) = self.object.progs().find(|p| p.name() == name) else {
            return Ok(None);
        };
        let fd = prog
            .as_fd()
            .try_clone_to_owned()
            .with_context(|| format!("Failed to duplicate fd of program {name}"))?;
        Ok(Some(fd))
    }

    /// Open a perf reader over the perf event array `map_name`
    pub fn open_perf_reader(
        &self,
        map_name: &str,
        pages: usize,
    ) -> Result<(ReaderHandle, PerfReader)> {
        let map = self
            .object
            .maps()
            .find(|m| m.name() == map_name)
            .with_context(|| format!("BPF map {map_name:?} not found"))?;
        perf::open_perf_reader(&map, pages)
    }

    pub fn attach_kprobe(&mut self, program: &str, function: &str, retprobe: bool) -> Result<Link> {
        let prog = self
            .object
            .progs_mut()
            .find(|p| p.name() == program)
            .with_context(|| format!("BPF program {program:?} not found"))?;
        let link = prog.attach_kprobe(retprobe, function)?;
        Ok(link)
    }

    /// Attach an iterator program, optionally scoped to the map `map`
    pub fn attach_iter(&mut self, program: &str, map: Option<BorrowedFd<'_>>) -> Result<Link> {
        let prog = self
            .object
            .progs_mut()
            .find(|p| p.name() == program)
            .with_context(|| format!("BPF program {program:?} not found"))?;
        let link = match map {
            Some(map) => prog.attach_iter(map)?,
            None => prog.attach()?,
        };
        Ok(link)
    }
}

impl std::fmt::Debug for LoadedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedObject")
            .field("name", &self.object.name())
            .finish()
    }
}
