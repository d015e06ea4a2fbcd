use rand::RngCore;


/// Source of the non-cryptographic randomness the link needs: session ids, challenges and
///  counter seeds. Key material is drawn from the OS RNG directly by the crypto module.
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send {
    fn next_u32(&mut self) -> u32;

    fn next_u16(&mut self) -> u16 {
        self.next_u32() as u16
    }
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32(&mut self) -> u32 {
        rand::thread_rng().next_u32()
    }
}
