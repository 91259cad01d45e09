use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cordage::coeio::{self, file};
use cordage::cord;
use cordage::fiber;
use cordage::Error;

#[test]
fn call_returns_the_closure_result() {
    cord::run(|| {
        let res = coeio::call(|| 21 * 2, Duration::from_secs(5)).unwrap();
        assert_eq!(res, 42);
    })
    .unwrap();
}

// While one fiber waits for an offloaded call, the rest of the cord keeps
// making progress.
#[test]
fn other_fibers_progress_during_a_call() {
    cord::run(|| {
        let sleeper_done = Rc::new(Cell::new(false));
        let flag = sleeper_done.clone();
        let sleeper = fiber::defer_proc(move || {
            fiber::sleep(Duration::from_millis(10));
            flag.set(true);
        });
        let res = coeio::call(
            || {
                std::thread::sleep(Duration::from_millis(100));
                "done"
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(res, "done");
        assert!(
            sleeper_done.get(),
            "the sleeper fiber should finish while the call is in flight"
        );
        sleeper.join();
    })
    .unwrap();
}

#[test]
fn call_times_out_and_detaches_the_task() {
    cord::run(|| {
        let started = Instant::now();
        let res = coeio::call(
            || std::thread::sleep(Duration::from_millis(300)),
            Duration::from_millis(30),
        );
        match res {
            Err(Error::TimedOut) => {}
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(300));
        // The detached task must not disturb this fiber later on.
        fiber::sleep(Duration::from_millis(400));
    })
    .unwrap();
}

#[test]
fn getaddrinfo_resolves_numeric_addresses() {
    cord::run(|| {
        let addrs = coeio::getaddrinfo("127.0.0.1", "3301", Duration::from_secs(5)).unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 3301));
        assert!(addrs.iter().any(|a| a.ip().is_loopback()));
    })
    .unwrap();
}

#[test]
fn file_operations_round_trip() {
    cord::run(|| {
        let template = std::env::temp_dir().join("cordage-test-XXXXXX");
        let dir = file::mkdtemp(&template).unwrap();

        let path = dir.join("data");
        let fd = file::open(
            &path,
            libc::O_CREAT | libc::O_RDWR,
            0o644,
        )
        .unwrap();
        assert_eq!(file::write(fd, b"payload").unwrap(), 7);
        file::fsync(fd).unwrap();
        assert_eq!(file::lseek(fd, 0, libc::SEEK_SET).unwrap(), 0);
        let mut buf = [0u8; 7];
        assert_eq!(file::read(fd, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
        file::close(fd).unwrap();

        let st = file::stat(&path).unwrap();
        assert_eq!(st.st_size, 7);

        let renamed = dir.join("data2");
        file::rename(&path, &renamed).unwrap();
        assert!(file::stat(&path).is_err());

        file::truncate(&renamed, 3).unwrap();
        assert_eq!(file::stat(&renamed).unwrap().st_size, 3);

        let sub = dir.join("sub");
        file::mkdir(&sub, 0o755).unwrap();
        let ln = dir.join("ln");
        file::symlink(&renamed, &ln).unwrap();
        assert_eq!(file::readlink(&ln).unwrap(), renamed);
        let st = file::lstat(&ln).unwrap();
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFLNK);

        let matches = file::glob(dir.join("*").as_os_str()).unwrap();
        assert_eq!(matches.len(), 3);

        file::unlink(&ln).unwrap();
        file::unlink(&renamed).unwrap();
        file::rmdir(&sub).unwrap();
        file::rmdir(&dir).unwrap();
    })
    .unwrap();
}

#[test]
fn file_errors_preserve_the_os_error() {
    cord::run(|| {
        let err = file::open("/definitely/not/there", libc::O_RDONLY, 0).unwrap_err();
        match err {
            Error::System(io) => assert_eq!(io.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected a system error, got {other:?}"),
        }
    })
    .unwrap();
}
