pub mod arch;
pub mod archive;
pub mod blkid;
pub mod dependencies;
pub mod files;
pub mod findmnt;
pub mod mount;
pub mod tabfile;
