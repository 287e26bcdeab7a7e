#![allow(non_snake_case)]

//! GristMR — out-of-core SPMD MapReduce engine.
//!
//! Два бинарных контейнера — KV (мультимножество пар ключ/значение) и
//! KMV (по записи на ключ со списком значений) — живут страницами
//! фиксированного размера, при нехватке RAM уходящими в spill-файлы.
//! Операции движка (map, aggregate, convert, reduce, сортировки и т.д.)
//! перегоняют данные между контейнерами и между рангами; пары ездят между
//! процессами хеш-партиционированием через irregular exchange.

// Базовые модули
pub mod config;
pub mod consts;
pub mod hash;
pub mod mem;
pub mod metrics;

// Контейнеры и их обвязка
pub mod kmv; // src/kmv/{mod,record,convert}.rs
pub mod kv; // src/kv/{mod,record}.rs
pub mod spool;

// Коммуникация и движок
pub mod comm; // src/comm/{mod,local,threads}.rs
pub mod exchange;
pub mod mr; // src/mr/{mod,map,sort,stats}.rs

// Удобные реэкспорты
pub use comm::{Communicator, ReduceOp, SelfComm, ThreadComm};
pub use config::{MapStyle, MrConfig, TimerMode, Verbosity};
pub use kmv::KeyMultiValue;
pub use kv::KeyValue;
pub use mr::{BlockCursor, HashFn, MapReduce, MultiValue, Separator};
