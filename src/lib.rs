//! Orbit is a userland runtime that offloads "checker" computations
//! to isolated sibling execution contexts observing copy-on-write
//! snapshots of selected host memory areas.  Checkers return a scalar
//! or a typed update log the host may later apply.
mod allocator;
mod area;
mod arena;
mod bitmap;
mod dispatch;
mod error;
mod file_backed_mapper;
mod future;
mod linear;
mod lock;
mod map;
mod mapper;
mod operation;
mod orbit;
mod snapshot;
mod task;
mod update;
mod wire;

pub use allocator::AllocatorMethod;
pub use allocator::AreaAllocator;
pub use area::Area;
pub use area::AreaConfig;
pub use area::SnapshotMode;
pub use bitmap::BLOCKS_PER_PAGE;
pub use bitmap::BLOCK_SIZE;
pub use bitmap::PAGE_SIZE;
pub use error::Error;
pub use error::Result;
pub use file_backed_mapper::set_file_backed_area_directory;
pub use future::Future;
pub use future::Pulled;
pub use mapper::register_mapper;
pub use mapper::Mapper;
pub use operation::register_operation;
pub use operation::OpToken;
pub use operation::OperationFn;
pub use orbit::destroy;
pub use orbit::destroy_all;
pub use orbit::is_orbit_context;
pub use orbit::EntryFn;
pub use orbit::InitFn;
pub use orbit::LifeState;
pub use orbit::Orbit;
pub use orbit::OrbitConfig;
pub use orbit::TaskOutput;
pub use orbit::ARG_SIZE_MAX;
pub use orbit::NAME_LEN;
pub use task::TaskFlags;
pub use update::Record;
pub use update::RecordKind;
pub use update::UpdateBuffer;
pub use update::ORBIT_BUFFER_MAX;
pub use update::SMALL_DATA_MAX;
