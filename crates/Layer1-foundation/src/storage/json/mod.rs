//! JSON 파일 저장소 (글로벌 / 프로젝트 설정)

mod store;

pub use store::{JsonStore, APEX_DIR_NAME, PROJECT_DIR_NAME};
