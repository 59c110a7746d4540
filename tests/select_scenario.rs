//! A writer fiber per pipe trickles bytes out with a delay between each;
//! one reader fiber uses `select` across all of them and must observe
//! every byte, in order, on every pipe.

use pth::fiber;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

fn make_nonblocking_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    (fds[0], fds[1])
}

#[test]
fn select_receives_every_byte_in_order_across_several_pipes() {
    const PIPES: usize = 4;
    const BYTES: u8 = 20;

    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for _ in 0..PIPES {
        let (r, w) = make_nonblocking_pipe();
        readers.push(r);
        writers.push(w);
    }

    for (i, &w) in writers.iter().enumerate() {
        let sentinel = i as u8;
        fiber::spawn(move || {
            for n in 0..BYTES {
                fiber::write(w, &[n.wrapping_add(sentinel)]).expect("pipe write failed");
                fiber::sleep(Duration::from_millis(3));
            }
            unsafe {
                libc::close(w);
            }
        })
        .expect("failed to spawn writer fiber");
    }

    let received = Rc::new(RefCell::new(vec![Vec::<u8>::new(); PIPES]));
    let reader_fds = readers.clone();
    let received_in_reader = received.clone();
    fiber::spawn(move || {
        let mut open = reader_fds.clone();
        while !open.is_empty() {
            let ready = fiber::select(
                fiber::SelectSets { read: &open, write: &[], except: &[] },
                Some(Duration::from_millis(500)),
            )
            .expect("select failed");
            for fd in ready.read {
                let mut buf = [0u8; 1];
                match fiber::read(fd, &mut buf) {
                    Ok(1) => {
                        let idx = reader_fds.iter().position(|&r| r == fd).unwrap();
                        received_in_reader.borrow_mut()[idx].push(buf[0]);
                    }
                    Ok(0) => open.retain(|&r| r != fd),
                    _ => {}
                }
            }
        }
        for fd in reader_fds {
            unsafe {
                libc::close(fd);
            }
        }
    })
    .expect("failed to spawn reader fiber");

    while fiber::count() > 0 {
        fiber::tick();
    }

    let received = received.borrow();
    for (i, bytes) in received.iter().enumerate() {
        let expected: Vec<u8> = (0..BYTES).map(|n| n.wrapping_add(i as u8)).collect();
        assert_eq!(*bytes, expected, "pipe {i} didn't receive every byte in order");
    }
}
