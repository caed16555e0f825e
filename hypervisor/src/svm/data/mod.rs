pub mod exit_state;
pub mod guest;
pub mod io_permission_map;
pub mod nested_page_table;
