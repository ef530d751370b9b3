//! Forward declarations of the runtime functions generated code calls
//!
//! Every external function is declared once per program with its host
//! address; translators call them through these `FunctionRef`s. The struct
//! types mirror the `#[repr(C)]` layouts in `veld_runtime`.

use veld_ir::{FunctionRef, ProgramBuilder, Type};

use veld_runtime::{column_data, column_index, hash_table, printer, skinner, string,
    tuple_idx_table, vector};

pub struct RuntimeTypes {
    /// `{ i8* data, i32 file_length, i8* map }`
    pub raw_column_data: Type,
    /// `{ i8* data, i32 len }`
    pub string_view: Type,
    /// `{ i64 element_size, i32 size, i32 capacity, i8* data }`
    pub vector: Type,
    /// `{ i64 element_size, i8* map }`
    pub hash_table: Type,
    /// `{ i32 num_buckets, i8* buckets }`
    pub bucket_list: Type,
    /// `{ i32* row_ids, i32 len }`
    pub index_bucket: Type,
}

pub struct RuntimeFunctions {
    pub types: RuntimeTypes,

    // column data
    pub column_open: FunctionRef,
    pub column_close: FunctionRef,
    pub column_size_i8: FunctionRef,
    pub column_size_i16: FunctionRef,
    pub column_size_i32: FunctionRef,
    pub column_size_i64: FunctionRef,
    pub column_size_f64: FunctionRef,
    pub column_size_text: FunctionRef,
    pub column_get_text: FunctionRef,

    // vectors
    pub vector_create: FunctionRef,
    pub vector_push_back: FunctionRef,
    pub vector_get: FunctionRef,
    pub vector_size: FunctionRef,
    pub vector_sort: FunctionRef,
    pub vector_free: FunctionRef,

    // hash table
    pub hash_table_create: FunctionRef,
    pub hash_table_insert: FunctionRef,
    pub hash_table_get_bucket: FunctionRef,
    pub hash_table_get_all_buckets: FunctionRef,
    pub bucket_list_get: FunctionRef,
    pub bucket_list_free: FunctionRef,
    pub hash_table_free: FunctionRef,
    pub hash_combine: FunctionRef,

    // strings
    pub string_equals: FunctionRef,
    pub string_less_than: FunctionRef,
    pub string_contains: FunctionRef,
    pub string_starts_with: FunctionRef,
    pub string_ends_with: FunctionRef,
    pub string_like: FunctionRef,
    pub string_regex: FunctionRef,
    pub string_hash: FunctionRef,
    pub string_copy: FunctionRef,

    // dates
    pub date_extract_year: FunctionRef,

    // printer
    pub print_bool: FunctionRef,
    pub print_i16: FunctionRef,
    pub print_i32: FunctionRef,
    pub print_i64: FunctionRef,
    pub print_f64: FunctionRef,
    pub print_date: FunctionRef,
    pub print_string: FunctionRef,
    pub print_null: FunctionRef,
    pub print_newline: FunctionRef,

    // tuple-index set
    pub tit_create: FunctionRef,
    pub tit_insert: FunctionRef,
    pub tit_iter_create: FunctionRef,
    pub tit_iter_size: FunctionRef,
    pub tit_iter_get: FunctionRef,
    pub tit_iter_free: FunctionRef,
    pub tit_free: FunctionRef,

    // column indexes
    pub disk_index_open_i32: FunctionRef,
    pub disk_index_open_i64: FunctionRef,
    pub disk_index_get_bucket: FunctionRef,
    pub disk_index_free: FunctionRef,
    pub mem_index_create: FunctionRef,
    pub mem_index_insert: FunctionRef,
    pub mem_index_get_next_greater: FunctionRef,
    pub mem_index_free: FunctionRef,
    pub bucket_array_create: FunctionRef,
    pub bucket_array_push: FunctionRef,
    pub bucket_array_init_intersection: FunctionRef,
    pub bucket_array_populate: FunctionRef,
    pub bucket_array_free: FunctionRef,

    // adaptive executors
    pub execute_permutable_scan_select: FunctionRef,
    pub execute_permutable_join: FunctionRef,
    pub execute_recompiling_join: FunctionRef,
}

impl RuntimeFunctions {
    pub fn declare(p: &mut ProgramBuilder) -> Self {
        let void = p.void_type();
        let i1 = p.i1_type();
        let i8 = p.i8_type();
        let i16 = p.i16_type();
        let i32t = p.i32_type();
        let i64t = p.i64_type();
        let f64t = p.f64_type();
        let i8p = p.pointer_type(i8);
        let i32p = p.pointer_type(i32t);
        let i64p = p.pointer_type(i64t);

        let raw_column_data = p
            .struct_type(&[i8p, i32t, i8p], Some("veld_raw_column_data"))
            .expect("fresh program");
        let string_view = p
            .struct_type(&[i8p, i32t], Some("veld_string_view"))
            .expect("fresh program");
        let vector_ty = p
            .struct_type(&[i64t, i32t, i32t, i8p], Some("veld_vector"))
            .expect("fresh program");
        let hash_table_ty = p
            .struct_type(&[i64t, i8p], Some("veld_hash_table"))
            .expect("fresh program");
        let bucket_list_ty = p
            .struct_type(&[i32t, i8p], Some("veld_bucket_list"))
            .expect("fresh program");
        let index_bucket_ty = p
            .struct_type(&[i32p, i32t], Some("veld_index_bucket"))
            .expect("fresh program");

        let col_p = p.pointer_type(raw_column_data);
        let view_p = p.pointer_type(string_view);
        let vec_p = p.pointer_type(vector_ty);
        let ht_p = p.pointer_type(hash_table_ty);
        let bl_p = p.pointer_type(bucket_list_ty);
        let ib_p = p.pointer_type(index_bucket_ty);

        let types = RuntimeTypes {
            raw_column_data,
            string_view,
            vector: vector_ty,
            hash_table: hash_table_ty,
            bucket_list: bucket_list_ty,
            index_bucket: index_bucket_ty,
        };

        macro_rules! declare {
            ($name:literal, $addr:expr, $ret:expr, [$($arg:expr),*]) => {
                p.declare_external_function($name, $ret, &[$($arg),*], $addr as usize)
            };
        }

        RuntimeFunctions {
            column_open: declare!("veld_column_open", column_data::veld_column_open as *const () as usize, void, [col_p, i8p]),
            column_close: declare!("veld_column_close", column_data::veld_column_close as *const () as usize, void, [col_p]),
            column_size_i8: declare!("veld_column_size_i8", column_data::veld_column_size_i8 as *const () as usize, i32t, [col_p]),
            column_size_i16: declare!("veld_column_size_i16", column_data::veld_column_size_i16 as *const () as usize, i32t, [col_p]),
            column_size_i32: declare!("veld_column_size_i32", column_data::veld_column_size_i32 as *const () as usize, i32t, [col_p]),
            column_size_i64: declare!("veld_column_size_i64", column_data::veld_column_size_i64 as *const () as usize, i32t, [col_p]),
            column_size_f64: declare!("veld_column_size_f64", column_data::veld_column_size_f64 as *const () as usize, i32t, [col_p]),
            column_size_text: declare!("veld_column_size_text", column_data::veld_column_size_text as *const () as usize, i32t, [col_p]),
            column_get_text: declare!("veld_column_get_text", column_data::veld_column_get_text as *const () as usize, void, [col_p, i32t, view_p]),

            vector_create: declare!("veld_vector_create", vector::veld_vector_create as *const () as usize, void, [vec_p, i64t, i32t]),
            vector_push_back: declare!("veld_vector_push_back", vector::veld_vector_push_back as *const () as usize, i8p, [vec_p]),
            vector_get: declare!("veld_vector_get", vector::veld_vector_get as *const () as usize, i8p, [vec_p, i32t]),
            vector_size: declare!("veld_vector_size", vector::veld_vector_size as *const () as usize, i32t, [vec_p]),
            vector_sort: declare!("veld_vector_sort", vector::veld_vector_sort as *const () as usize, void, [vec_p, i8p]),
            vector_free: declare!("veld_vector_free", vector::veld_vector_free as *const () as usize, void, [vec_p]),

            hash_table_create: declare!("veld_hash_table_create", hash_table::veld_hash_table_create as *const () as usize, void, [ht_p, i64t]),
            hash_table_insert: declare!("veld_hash_table_insert", hash_table::veld_hash_table_insert as *const () as usize, i8p, [ht_p, i64t]),
            hash_table_get_bucket: declare!("veld_hash_table_get_bucket", hash_table::veld_hash_table_get_bucket as *const () as usize, vec_p, [ht_p, i64t]),
            hash_table_get_all_buckets: declare!("veld_hash_table_get_all_buckets", hash_table::veld_hash_table_get_all_buckets as *const () as usize, void, [ht_p, bl_p]),
            bucket_list_get: declare!("veld_bucket_list_get", hash_table::veld_bucket_list_get as *const () as usize, vec_p, [bl_p, i32t]),
            bucket_list_free: declare!("veld_bucket_list_free", hash_table::veld_bucket_list_free as *const () as usize, void, [bl_p]),
            hash_table_free: declare!("veld_hash_table_free", hash_table::veld_hash_table_free as *const () as usize, void, [ht_p]),
            hash_combine: declare!("veld_hash_combine", hash_table::veld_hash_combine as *const () as usize, void, [i64p, i64t]),

            string_equals: declare!("veld_string_equals", string::veld_string_equals as *const () as usize, i1, [view_p, view_p]),
            string_less_than: declare!("veld_string_less_than", string::veld_string_less_than as *const () as usize, i1, [view_p, view_p]),
            string_contains: declare!("veld_string_contains", string::veld_string_contains as *const () as usize, i1, [view_p, view_p]),
            string_starts_with: declare!("veld_string_starts_with", string::veld_string_starts_with as *const () as usize, i1, [view_p, view_p]),
            string_ends_with: declare!("veld_string_ends_with", string::veld_string_ends_with as *const () as usize, i1, [view_p, view_p]),
            string_like: declare!("veld_string_like", string::veld_string_like as *const () as usize, i1, [view_p, view_p]),
            string_regex: declare!("veld_string_regex_match", string::veld_string_regex_match as *const () as usize, i1, [view_p, i8p]),
            string_hash: declare!("veld_string_hash", string::veld_string_hash as *const () as usize, i64t, [view_p]),
            string_copy: declare!("veld_string_copy", string::veld_string_copy as *const () as usize, void, [view_p, view_p]),

            date_extract_year: declare!("veld_date_extract_year", veld_runtime::date::veld_date_extract_year as *const () as usize, i32t, [i32t]),

            print_bool: declare!("veld_print_bool", printer::veld_print_bool as *const () as usize, void, [i1]),
            print_i16: declare!("veld_print_i16", printer::veld_print_i16 as *const () as usize, void, [i16]),
            print_i32: declare!("veld_print_i32", printer::veld_print_i32 as *const () as usize, void, [i32t]),
            print_i64: declare!("veld_print_i64", printer::veld_print_i64 as *const () as usize, void, [i64t]),
            print_f64: declare!("veld_print_f64", printer::veld_print_f64 as *const () as usize, void, [f64t]),
            print_date: declare!("veld_print_date", printer::veld_print_date as *const () as usize, void, [i32t]),
            print_string: declare!("veld_print_string", printer::veld_print_string as *const () as usize, void, [view_p]),
            print_null: declare!("veld_print_null", printer::veld_print_null as *const () as usize, void, []),
            print_newline: declare!("veld_print_newline", printer::veld_print_newline as *const () as usize, void, []),

            tit_create: declare!("veld_tit_create", tuple_idx_table::veld_tit_create as *const () as usize, i8p, []),
            tit_insert: declare!("veld_tit_insert", tuple_idx_table::veld_tit_insert as *const () as usize, i1, [i8p, i32p, i32t]),
            tit_iter_create: declare!("veld_tit_iter_create", tuple_idx_table::veld_tit_iter_create as *const () as usize, i8p, [i8p, i32t]),
            tit_iter_size: declare!("veld_tit_iter_size", tuple_idx_table::veld_tit_iter_size as *const () as usize, i32t, [i8p]),
            tit_iter_get: declare!("veld_tit_iter_get", tuple_idx_table::veld_tit_iter_get as *const () as usize, i32p, [i8p, i32t]),
            tit_iter_free: declare!("veld_tit_iter_free", tuple_idx_table::veld_tit_iter_free as *const () as usize, void, [i8p]),
            tit_free: declare!("veld_tit_free", tuple_idx_table::veld_tit_free as *const () as usize, void, [i8p]),

            disk_index_open_i32: declare!("veld_disk_index_open_i32", column_index::veld_disk_index_open_i32 as *const () as usize, i8p, [i8p]),
            disk_index_open_i64: declare!("veld_disk_index_open_i64", column_index::veld_disk_index_open_i64 as *const () as usize, i8p, [i8p]),
            disk_index_get_bucket: declare!("veld_disk_index_get_bucket", column_index::veld_disk_index_get_bucket as *const () as usize, void, [i8p, i64t, ib_p]),
            disk_index_free: declare!("veld_disk_index_free", column_index::veld_disk_index_free as *const () as usize, void, [i8p]),
            mem_index_create: declare!("veld_mem_index_create", column_index::veld_mem_index_create as *const () as usize, i8p, []),
            mem_index_insert: declare!("veld_mem_index_insert", column_index::veld_mem_index_insert as *const () as usize, void, [i8p, i64t, i32t]),
            mem_index_get_next_greater: declare!("veld_mem_index_get_next_greater", column_index::veld_mem_index_get_next_greater as *const () as usize, i32t, [i8p, i64t, i32t, i32t]),
            mem_index_free: declare!("veld_mem_index_free", column_index::veld_mem_index_free as *const () as usize, void, [i8p]),
            bucket_array_create: declare!("veld_bucket_array_create", column_index::veld_bucket_array_create as *const () as usize, i8p, [i32t]),
            bucket_array_push: declare!("veld_bucket_array_push", column_index::veld_bucket_array_push as *const () as usize, void, [i8p, ib_p]),
            bucket_array_init_intersection: declare!("veld_bucket_array_init_intersection", column_index::veld_bucket_array_init_intersection as *const () as usize, void, [i8p, i32t]),
            bucket_array_populate: declare!("veld_bucket_array_populate", column_index::veld_bucket_array_populate as *const () as usize, i32t, [i8p, i32p, i32t, i32p, i32t]),
            bucket_array_free: declare!("veld_bucket_array_free", column_index::veld_bucket_array_free as *const () as usize, void, [i8p]),

            execute_permutable_scan_select: declare!(
                "veld_execute_permutable_scan_select",
                skinner::veld_execute_permutable_scan_select as *const () as usize,
                void,
                [i8p, i32t, i8p, i32p, i32t, i32p, i32p, i32p]
            ),
            execute_permutable_join: declare!(
                "veld_execute_permutable_join",
                skinner::veld_execute_permutable_join as *const () as usize,
                void,
                [i32t, i32t, i8p, i8p, i8p, i8p, i32p, i8p, i64p, i32p, i32p]
            ),
            execute_recompiling_join: declare!(
                "veld_execute_recompiling_join",
                skinner::veld_execute_recompiling_join as *const () as usize,
                void,
                [i32t, i32p, i32p, i8p, i8p]
            ),
            types,
        }
    }
}
