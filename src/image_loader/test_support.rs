//! 测试辅助：PNG 夹具与一次性 HTTP 服务端。

use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};

/// 生成纯色 PNG。
pub(crate) fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = ImageBuffer::from_pixel(width, height, Rgba(rgba));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("failed to encode test image");
    cursor.into_inner()
}

/// 一条预置的 HTTP 响应。
pub(crate) struct HttpReply {
    head: String,
    body: Vec<u8>,
}

impl HttpReply {
    pub(crate) fn ok(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            head: format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                content_type,
                body.len()
            ),
            body,
        }
    }

    pub(crate) fn status(code: u16, reason: &str) -> Self {
        Self {
            head: format!(
                "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code, reason
            ),
            body: Vec::new(),
        }
    }

    pub(crate) fn redirect(location: &str) -> Self {
        Self {
            head: format!(
                "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                location
            ),
            body: Vec::new(),
        }
    }
}

/// 依次为每个连接返回一条预置响应，全部发送完后线程退出。
pub(crate) fn spawn_http_server(replies: Vec<HttpReply>) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
    let addr = listener.local_addr().expect("read local addr failed");

    let server = thread::spawn(move || {
        for reply in replies {
            let (mut stream, _) = listener.accept().expect("accept failed");

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }

            stream.write_all(reply.head.as_bytes()).expect("write headers failed");
            stream.write_all(&reply.body).expect("write body failed");
            stream.flush().expect("flush failed");
        }
    });

    (addr, server)
}
