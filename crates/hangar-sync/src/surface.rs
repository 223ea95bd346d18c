/// Field surface: the typed stand-in for the rendered tile grid
/// Elements are addressed by `FieldId` and live in exactly one container.
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{CellId, Container, FieldId, FieldKind, Result, SyncError, TileState};

/// Where field values are rendered. Implementations use interior mutability;
/// every method is synchronous so a batch of writes can never be interleaved
/// with user input.
pub trait FieldSurface: Send + Sync {
    /// Container that currently holds the element, if it is rendered at all.
    fn locate(&self, field: &FieldId) -> Option<Container>;

    fn read(&self, field: &FieldId) -> Option<String>;

    /// Write into `container`. Fails with `ContainerMismatch` when the field
    /// does not belong there and `ElementMissing` when it is not rendered.
    fn write(&self, container: Container, field: &FieldId, value: &str) -> Result<()>;

    /// Rendered cells of one container, ascending.
    fn cells(&self, container: Container) -> Vec<CellId>;
}

/// How a plan treats fields whose element is not rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingElement {
    /// Silently skip (inbound data for tiles this client does not show).
    Skip,
    /// Abort the plan with `ElementMissing`.
    Fail,
}

/// Compute the writes needed to bring the surface to `tiles` without mutating
/// anything. Absent fields are left alone; equal values are not rewritten.
pub fn plan_tile_writes<'a>(
    surface: &dyn FieldSurface,
    tiles: &'a [TileState],
    missing: MissingElement,
    skip: impl Fn(&FieldId) -> bool,
) -> Result<Vec<(FieldId, &'a str)>> {
    let mut plan = Vec::new();
    for tile in tiles {
        for (field, value) in tile.present_fields() {
            if skip(&field) {
                continue;
            }
            let expected = field.container();
            match surface.locate(&field) {
                None => match missing {
                    MissingElement::Skip => continue,
                    MissingElement::Fail => return Err(SyncError::ElementMissing(field)),
                },
                Some(found) if found != expected => {
                    return Err(SyncError::ContainerMismatch {
                        field,
                        expected,
                        found,
                    });
                }
                Some(_) => {}
            }
            if surface.read(&field).as_deref() == Some(value) {
                continue;
            }
            plan.push((field, value));
        }
    }
    Ok(plan)
}

/// Execute a plan produced by [`plan_tile_writes`]. Returns the number of writes.
pub fn apply_tile_writes(surface: &dyn FieldSurface, plan: &[(FieldId, &str)]) -> Result<usize> {
    for (field, value) in plan {
        surface.write(field.container(), field, value)?;
    }
    Ok(plan.len())
}

/// Full snapshot of every rendered tile in both containers.
pub fn capture_tiles(surface: &dyn FieldSurface) -> Vec<TileState> {
    let mut tiles = Vec::new();
    for container in Container::ALL {
        for cell in surface.cells(container) {
            let mut tile = TileState::new(cell);
            for kind in FieldKind::ALL {
                if let Some(value) = surface.read(&FieldId::new(kind, cell)) {
                    tile.set_field(kind, value);
                }
            }
            tiles.push(tile);
        }
    }
    tiles.sort_by_key(|tile| tile.cell_id);
    tiles
}

/// In-memory two-container surface.
#[derive(Debug, Default)]
pub struct GridSurface {
    containers: RwLock<HashMap<Container, BTreeMap<FieldId, String>>>,
    writes: AtomicUsize,
}

impl GridSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `primary` tiles (cells 1..) and `secondary` tiles (cells 101..)
    /// with every field at its default value.
    pub fn with_tiles(primary: u32, secondary: u32) -> Self {
        let surface = Self::new();
        let primary_cells = (1..=primary).map(CellId);
        let secondary_cells =
            (0..secondary).map(|offset| CellId(CellId::SECONDARY_START + offset));
        for cell in primary_cells.chain(secondary_cells) {
            for kind in FieldKind::ALL {
                surface.insert_element(cell.container(), FieldId::new(kind, cell));
            }
        }
        surface
    }

    /// Render one element in the given container, even if it does not belong there.
    pub fn insert_element(&self, container: Container, field: FieldId) {
        self.containers
            .write()
            .entry(container)
            .or_default()
            .insert(field, field.kind.default_value().to_string());
    }

    pub fn remove_element(&self, field: &FieldId) {
        for elements in self.containers.write().values_mut() {
            elements.remove(field);
        }
    }

    /// Contents of one container, for assertions.
    pub fn container_values(&self, container: Container) -> BTreeMap<FieldId, String> {
        self.containers
            .read()
            .get(&container)
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl FieldSurface for GridSurface {
    fn locate(&self, field: &FieldId) -> Option<Container> {
        let containers = self.containers.read();
        let holds = |c: Container| containers.get(&c).is_some_and(|e| e.contains_key(field));
        let expected = field.container();
        if holds(expected) {
            return Some(expected);
        }
        Container::ALL.into_iter().find(|c| holds(*c))
    }

    fn read(&self, field: &FieldId) -> Option<String> {
        let container = self.locate(field)?;
        self.containers.read().get(&container)?.get(field).cloned()
    }

    fn write(&self, container: Container, field: &FieldId, value: &str) -> Result<()> {
        let expected = field.container();
        if container != expected {
            return Err(SyncError::ContainerMismatch {
                field: *field,
                expected,
                found: container,
            });
        }
        let mut containers = self.containers.write();
        let slot = containers
            .get_mut(&container)
            .and_then(|elements| elements.get_mut(field))
            .ok_or(SyncError::ElementMissing(*field))?;
        *slot = value.to_string();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cells(&self, container: Container) -> Vec<CellId> {
        let containers = self.containers.read();
        let cells: BTreeSet<CellId> = containers
            .get(&container)
            .map(|elements| {
                elements
                    .keys()
                    .filter(|field| field.container() == container)
                    .map(|field| field.cell)
                    .collect()
            })
            .unwrap_or_default();
        cells.into_iter().collect()
    }
}
