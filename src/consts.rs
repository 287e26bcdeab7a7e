//! Общие константы движка (страницы, spill-файлы, обменные теги).

// -------- Files --------

/// Образ страницы на диске выравнивается до этой границы.
/// Spill-файл = сырая конкатенация выровненных образов, без заголовка.
pub const ALIGN_FILE: usize = 512;

/// Префикс spill-файлов контейнеров: grist.<kind>.<instance>.<seq>.<rank>.spill
pub const SPILL_PREFIX: &str = "grist";
pub const SPILL_EXT: &str = "spill";

pub const KIND_KV: &str = "kv";
pub const KIND_KMV: &str = "kmv";
pub const KIND_SPOOL: &str = "sps";

// -------- Pages --------

/// Минимальное выравнивание ключа/значения (ширина длинного префикса i32).
pub const ALIGN_KV_MIN: usize = 4;

/// Default key/value alignment (same as the length-prefix width).
pub const ALIGN_KV_DEFAULT: usize = 4;

/// Жёсткий потолок записей на страницу (формат хранит счётчики как i32).
pub const PAGE_RECORD_MAX: u64 = i32::MAX as u64;

// -------- Memory --------

/// Default in-RAM buffer size, MB. Quarter of it is the container page size.
pub const MEMSIZE_MB_DEFAULT: u64 = 64;

/// memsize должен делиться на это, чтобы quarter был кратен ALIGN_FILE.
pub const MEMSIZE_GRAIN: u64 = 4 * ALIGN_FILE as u64;

// -------- Env --------

pub const ENV_PREFIX: &str = "GMR_";

// -------- Exchange / p2p tags --------
//
// Теги фиксированы на уровне библиотеки; пользовательских тегов нет.

pub const TAG_XCHG_SIZES: u32 = 101;
pub const TAG_XCHG_DATA: u32 = 102;
pub const TAG_GATHER_HDR: u32 = 103;
pub const TAG_GATHER_PAGE: u32 = 104;
pub const TAG_MAP_TASK: u32 = 105;
pub const TAG_MAP_ACK: u32 = 106;
pub const TAG_BCAST: u32 = 107;
pub const TAG_REDUCE_UP: u32 = 108;
pub const TAG_REDUCE_DOWN: u32 = 109;
