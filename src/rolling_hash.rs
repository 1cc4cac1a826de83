/// Rolling hash over a fixed 16-byte window, as used by the Fossil delta encoder.
///
/// Two 16-bit sums (a, b) combined into a 32-bit hash. The window bytes are
/// kept in a ring so `rotate` only needs the incoming byte.
pub const WINDOW: usize = 16;

pub struct RollingHash {
    a: u16,
    b: u16,
    head: usize,
    window: [u8; WINDOW],
}

impl RollingHash {
    /// Hash the first `WINDOW` bytes of `data`.
    pub fn new(data: &[u8]) -> Self {
        let mut window = [0u8; WINDOW];
        window.copy_from_slice(&data[..WINDOW]);

        let mut a = window[0] as u16;
        let mut b = a;
        for &byte in &window[1..] {
            a = a.wrapping_add(byte as u16);
            b = b.wrapping_add(a);
        }

        Self {
            a,
            b,
            head: 0,
            window,
        }
    }

    /// Slide the window one byte: drop the oldest byte, take `new_byte`.
    pub fn rotate(&mut self, new_byte: u8) {
        let old = self.window[self.head] as u16;
        self.window[self.head] = new_byte;
        self.head = (self.head + 1) & (WINDOW - 1);

        self.a = self.a.wrapping_sub(old).wrapping_add(new_byte as u16);
        self.b = self
            .b
            .wrapping_sub(old.wrapping_mul(WINDOW as u16))
            .wrapping_add(self.a);
    }

    pub fn digest(&self) -> u32 {
        (self.a as u32) | ((self.b as u32) << 16)
    }
}
