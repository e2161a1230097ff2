mod files;
mod health;
mod uploads;
mod view;

pub use files::{
    delete_file, download_url, file_info, list_files, stats, view_url, DeleteResponse,
    DownloadUrlResponse, FileResponse, ListFilesResponse, StatsResponse, ViewUrlResponse,
};
pub use health::{health, HealthResponse};
pub use uploads::{import_url, upload, upload_multiple, AcceptedResponse};
pub use view::view_file;
