pub mod path;

pub use path::{
    directory_of, extension, file_name, file_stem, has_extension, is_hidden, os_path_to_string,
    relative_path, strip_extension, string_to_os_path,
};
