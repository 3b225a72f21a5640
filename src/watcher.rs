//! Filesystem watcher: turns kernel inotify events into FILE-UPDATE /
//! FILE-CLOSE messages for the parser.
//!
//! Raw `libc` calls (`inotify_init1` / `poll` / `read`) with manual
//! `inotify_event` header parsing, no crate wrapper around inotify.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::mem;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libc::{
    inotify_add_watch, inotify_event, inotify_init1, poll, pollfd, read as libc_read, IN_CLOEXEC,
    IN_CREATE, IN_DELETE, IN_EXCL_UNLINK, IN_IGNORED, IN_MODIFY, IN_MOVED_FROM, IN_MOVED_TO,
    IN_MOVE_SELF, IN_ONLYDIR, IN_Q_OVERFLOW, POLLIN,
};

use crate::error::{Error, Result};
use crate::queue::MessageQueue;
use crate::signals::{
    install_termination_handler_in_current_thread, is_terminating,
    register_current_thread_as_watcher,
};
use crate::watched::{DirectoryItem, FileItem, WatchedDirConfig, WatchedFileConfig};

/// Tags carried on the watcher→parser queue. `Close` outranks `Update` so
/// a close arriving after a pending update is not lost to the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileTag {
    Update,
    Close,
}

const DIR_MASK: u32 =
    (IN_CREATE | IN_MOVED_FROM | IN_MOVED_TO | IN_DELETE | IN_MOVE_SELF | IN_EXCL_UNLINK | IN_ONLYDIR) as u32;
const FILE_MASK: u32 = IN_MODIFY as u32;

pub struct Watcher {
    fd: RawFd,
    dirs: HashMap<i32, DirectoryItem>,
    files_by_wd: HashMap<i32, Arc<FileItem>>,
    files_by_path: HashMap<PathBuf, Arc<FileItem>>,
    queue: Arc<MessageQueue<Arc<FileItem>, FileTag>>,
    seek0: bool,
}

impl Watcher {
    pub fn new(
        dir_configs: Vec<Arc<WatchedDirConfig>>,
        queue: Arc<MessageQueue<Arc<FileItem>, FileTag>>,
        seek0: bool,
    ) -> Result<Self> {
        let fd = unsafe { inotify_init1(IN_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let mut watcher = Self {
            fd,
            dirs: HashMap::new(),
            files_by_wd: HashMap::new(),
            files_by_path: HashMap::new(),
            queue,
            seek0,
        };
        for dir_config in dir_configs {
            if let Err(err) = watcher.watch_directory(dir_config) {
                log::warn!(target: "log2pg::watcher", "skipping watched directory: {err}");
            }
        }
        Ok(watcher)
    }

    fn watch_directory(&mut self, dir_config: Arc<WatchedDirConfig>) -> Result<()> {
        let path = dir_config.path.clone();
        std::fs::read_dir(&path)?;
        let wd = add_watch(self.fd, &path, DIR_MASK)?;
        self.dirs.insert(
            wd,
            DirectoryItem {
                wd,
                path: path.clone(),
                config: dir_config.clone(),
            },
        );

        for entry in std::fs::read_dir(&path)? {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    log::warn!(target: "log2pg::watcher", "cannot read directory entry: {err}");
                    continue;
                }
            };
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(file_config) = dir_config.matching(&filename) else {
                continue;
            };
            let file_path = entry.path();
            if let Err(err) = self.watch_file(file_config.clone(), file_path.clone()) {
                log::warn!(target: "log2pg::watcher", "cannot watch file {}: {err}", file_path.display());
            }
        }
        Ok(())
    }

    fn watch_file(&mut self, config: Arc<WatchedFileConfig>, path: PathBuf) -> Result<()> {
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Ok(());
        }
        if self.files_by_path.contains_key(&path) {
            return Ok(());
        }
        let mut stream = File::open(&path)?;
        if !self.seek0 {
            stream.seek(SeekFrom::End(0))?;
        }
        let wd = add_watch(self.fd, &path, FILE_MASK)?;
        let item = Arc::new(FileItem::new(wd, path.clone(), config, stream));
        self.files_by_wd.insert(wd, item.clone());
        self.files_by_path.insert(path, item.clone());
        self.queue.push(item, FileTag::Update);
        Ok(())
    }

    fn unwatch_file(&mut self, path: &Path) {
        if let Some(item) = self.files_by_path.remove(path) {
            self.files_by_wd.remove(&item.wd);
            unsafe {
                libc::inotify_rm_watch(self.fd, item.wd);
            }
            self.queue.push(item, FileTag::Close);
        }
    }

    /// Blocks on the inotify descriptor until shutdown or a fatal error.
    /// Must run on a thread that has unblocked SIGINT/SIGABRT/SIGTERM via
    /// [`crate::signals::install_termination_handler_in_current_thread`].
    pub fn run(&mut self) -> Result<()> {
        install_termination_handler_in_current_thread()?;
        register_current_thread_as_watcher();
        let mut buffer = vec![0u8; 64 * 1024];
        let header_size = mem::size_of::<inotify_event>();

        loop {
            if is_terminating() {
                break;
            }
            let mut pfd = pollfd {
                fd: self.fd,
                events: POLLIN,
                revents: 0,
            };
            let res = unsafe { poll(&mut pfd, 1, -1) };
            if res < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }
            if (pfd.revents & POLLIN) == 0 {
                continue;
            }

            let len = unsafe { libc_read(self.fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
            if len < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }

            let mut offset = 0usize;
            while offset + header_size <= len as usize {
                let header = &buffer[offset..offset + header_size];
                let Some((wd, mask, name_len)) = parse_event_header(header) else {
                    break;
                };
                let name_start = offset + header_size;
                let name_end = name_start.saturating_add(name_len as usize);
                if name_end > len as usize {
                    break;
                }
                let name = if name_len > 0 {
                    let bytes = &buffer[name_start..name_end];
                    let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    String::from_utf8_lossy(&bytes[..nul]).into_owned()
                } else {
                    String::new()
                };
                offset = name_end;

                self.handle_event(wd, mask as u32, &name);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn handle_event(&mut self, wd: i32, mask: u32, name: &str) {
        if mask & IN_Q_OVERFLOW as u32 != 0 {
            log::warn!(target: "log2pg::watcher", "inotify queue overflow; some events were dropped");
            return;
        }
        if mask & IN_IGNORED as u32 != 0 {
            self.dirs.remove(&wd);
            if let Some(item) = self.files_by_wd.remove(&wd) {
                self.files_by_path.remove(&item.path);
            }
            return;
        }

        if let Some(dir) = self.dirs.get(&wd) {
            let dir_path = dir.path.clone();
            let dir_config = dir.config.clone();

            if mask & (IN_CREATE | IN_MOVED_TO) as u32 != 0 {
                if let Some(file_config) = dir_config.matching(name) {
                    let file_path = dir_path.join(name);
                    if let Err(err) = self.watch_file(file_config.clone(), file_path.clone()) {
                        log::warn!(target: "log2pg::watcher", "cannot watch new file {}: {err}", file_path.display());
                    }
                }
                return;
            }
            if mask & (IN_DELETE | IN_MOVED_FROM) as u32 != 0 {
                let file_path = dir_path.join(name);
                self.unwatch_file(&file_path);
                return;
            }
            if mask & IN_MOVE_SELF as u32 != 0 {
                let under_dir: Vec<PathBuf> = self
                    .files_by_path
                    .keys()
                    .filter(|p| p.starts_with(&dir_path))
                    .cloned()
                    .collect();
                for path in under_dir {
                    self.unwatch_file(&path);
                }
                unsafe {
                    libc::inotify_rm_watch(self.fd, wd);
                }
                self.dirs.remove(&wd);
                return;
            }
            return;
        }

        if mask & IN_MODIFY as u32 != 0 {
            if let Some(item) = self.files_by_wd.get(&wd) {
                self.queue.push(item.clone(), FileTag::Update);
            }
        }
    }

    fn shutdown(&mut self) {
        let paths: Vec<PathBuf> = self.files_by_path.keys().cloned().collect();
        for path in paths {
            self.unwatch_file(&path);
        }
        self.queue.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn add_watch(fd: RawFd, path: &Path, mask: u32) -> Result<i32> {
    let cpath = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| Error::Config(format!("path contains a NUL byte: {}", path.display())))?;
    let wd = unsafe { inotify_add_watch(fd, cpath.as_ptr(), mask) };
    if wd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(wd)
}

fn parse_event_header(buf: &[u8]) -> Option<(i32, u32, u32)> {
    if buf.len() < mem::size_of::<inotify_event>() {
        return None;
    }
    let wd = i32::from_ne_bytes(buf[0..4].try_into().ok()?);
    let mask = u32::from_ne_bytes(buf[4..8].try_into().ok()?);
    let len = u32::from_ne_bytes(buf[12..16].try_into().ok()?);
    Some((wd, mask, len))
}
