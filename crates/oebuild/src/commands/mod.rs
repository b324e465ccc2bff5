/// `oebuild bitbake`.
pub mod bitbake;
/// `oebuild clear`.
pub mod clear;
/// `oebuild docker-save`.
pub mod docker_save;
/// `oebuild generate`.
pub mod generate;
/// `oebuild init`.
pub mod init;
/// `oebuild manifest`.
pub mod manifest;
/// `oebuild update`.
pub mod update;
