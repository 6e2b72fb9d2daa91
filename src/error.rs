use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error at position {position}: {source}")]
    Xml {
        source: quick_xml::Error,
        position: usize,
    },

    #[error("XML write error: {0}")]
    XmlWrite(#[from] quick_xml::Error),

    #[error("Malformed UCDB: {0}")]
    Malformed(String),

    #[error("Duplicated line {line} in class '{class}'")]
    DuplicateLine { class: String, line: u32 },

    #[error("Duplicated class '{0}'")]
    DuplicateClass(String),

    #[error("Duplicated package '{0}'")]
    DuplicatePackage(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
